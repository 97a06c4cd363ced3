//! A small line-oriented debug client, dispatching directly against a local
//! `kvcore::apply::Node` rather than through the gRPC surface. Intended for
//! poking at a node during development; the gRPC services in `server/` are
//! the real client-facing protocol.

pub mod command;

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use rustyline::config::Builder;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{CompletionType, Editor};

use kvcore::apply::Node;

use crate::rusty::CliHelper;
use crate::server::config::DEFAULT_PROMPT;
use command::{dispatch, Outcome};

pub struct Repl {
    node: Arc<Node>,
    running: Arc<AtomicBool>,
    prompt: String,
}

impl Repl {
    pub fn new(node: Arc<Node>, running: Arc<AtomicBool>, prompt: Option<String>) -> Self {
        Self { node, running, prompt: prompt.unwrap_or_else(|| DEFAULT_PROMPT.to_string()) }
    }

    pub async fn handle_repl(&self) {
        println!("Welcome to {}.", self.prompt);
        println!("Talking directly to the local node (no gRPC).");
        println!();

        let config = Builder::new()
            .completion_prompt_limit(5)
            .completion_type(CompletionType::Circular)
            .build();
        let mut rl = Editor::<CliHelper, DefaultHistory>::with_config(config).unwrap();
        rl.set_helper(Some(CliHelper::new()));
        rl.load_history(&history_path()).ok();

        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            match rl.readline(&format!("{} > ", self.prompt)) {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let _ = rl.add_history_entry(line);
                    match dispatch(&self.node, line).await {
                        Outcome::Printed(text) => println!("{text}"),
                        Outcome::Exit => break,
                        Outcome::Error(err) => eprintln!("error: {err}"),
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("^C");
                    self.running.store(false, Ordering::SeqCst);
                }
                Err(ReadlineError::Eof) => break,
                Err(err) => {
                    eprintln!("io err: {err}");
                    break;
                }
            }
        }

        println!("Bye~");
        let _ = rl.save_history(&history_path());
    }

    /// Runs every line from `r` as a single non-interactive batch, printing
    /// elapsed time at the end the way `kv-rs`'s original batch mode did.
    pub async fn handle_reader<R: BufRead>(&self, r: R) -> Result<()> {
        let start = Instant::now();
        for line in r.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match dispatch(&self.node, line).await {
                Outcome::Printed(text) => println!("{text}"),
                Outcome::Exit => break,
                Outcome::Error(err) => eprintln!("error: {err}"),
            }
        }
        println!("{:.3}", start.elapsed().as_secs_f64());
        Ok(())
    }
}

fn history_path() -> String {
    format!("{}/.kvserverd_history", std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
}
