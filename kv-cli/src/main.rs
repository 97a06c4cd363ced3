use std::env;
use std::io::{stdin, IsTerminal};
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::info;

use kvcore::apply::Node;
use kvcore::raft::SingleNodeRaft;
use kvcore::storage::engine::Engine;
use kvcore::storage::memory::ShardedMemory;
use kvcore::storage::persistent::Persistent;
use kvserverd::repl::Repl;
use kvserverd::server::{self, config::ConfigLoad, config::EngineKind};
use kvserverd::trace;

#[derive(Debug, Parser, PartialEq)]
#[command(version, author, about)]
pub struct Args {
    /// Configuration file path.
    #[clap(short = 'c', long = "config", default_value = "config/kvserverd.yaml")]
    config: String,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Skip starting the gRPC server and drop into a debug REPL against an
    /// in-process, non-replicated node instead.
    #[clap(long)]
    repl: bool,

    /// Force non-interactive REPL mode: read queries from stdin as a batch
    /// instead of opening an interactive line editor.
    #[clap(short = 'n', long)]
    non_interactive: bool,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    setup_panic_hooks();

    let args = Args::parse();

    let log_dir = format!("{}/.kvserverd", env::var("HOME").unwrap_or_else(|_| ".".to_string()));
    let _guards = trace::init_logging(&log_dir, &args.log_level).await?;
    info!("kvserverd starting, args: {:?}", &args);

    let cfg = ConfigLoad::load(&args.config).unwrap_or_else(|err| {
        log::warn!("failed to load config from {:?}, using defaults: {err}", &args.config);
        ConfigLoad::default()
    });

    if args.repl {
        run_repl(cfg, args.non_interactive).await
    } else {
        server::run(cfg).await
    }
}

async fn run_repl(cfg: ConfigLoad, non_interactive: bool) -> Result<()> {
    let engine: Box<dyn Engine> = match cfg.engine {
        EngineKind::Memory => Box::new(ShardedMemory::new()),
        EngineKind::Persistent => Box::new(Persistent::new(cfg.data_dir())?),
    };
    let raft = Arc::new(SingleNodeRaft::new());
    let node = Arc::new(Node::new(engine, raft, 0));
    tokio::spawn(node.clone().spawn_apply_loop());

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || r.store(false, Ordering::SeqCst))
        .expect("error setting Ctrl-C handler");

    let repl = Repl::new(node, running, cfg.prompt.clone());

    let is_repl = stdin().is_terminal() && !non_interactive;
    if is_repl {
        repl.handle_repl().await;
    } else {
        repl.handle_reader(stdin().lock()).await?;
    }
    Ok(())
}

fn setup_panic_hooks() {
    let meta = human_panic::Metadata {
        version: env!("CARGO_PKG_VERSION").into(),
        name: env!("CARGO_PKG_NAME").into(),
        authors: env!("CARGO_PKG_AUTHORS").replace(':', ", ").into(),
        homepage: env!("CARGO_PKG_HOMEPAGE").into(),
    };

    let default_hook = panic::take_hook();
    if env::var("RUST_BACKTRACE").is_err() {
        panic::set_hook(Box::new(move |info: &panic::PanicInfo| {
            default_hook(info);
            let file_path = human_panic::handle_dump(&meta, info);
            human_panic::print_msg(file_path, &meta)
                .expect("human-panic: printing error message to console failed");
        }));
    }
}
