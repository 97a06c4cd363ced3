pub mod auth;
pub mod auth_service;
pub mod cluster_service;
pub mod config;
pub mod kv_service;
pub mod lease_service;
pub mod maintenance_service;
pub mod watch_service;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use tonic::transport::Server;
use tonic::Status;

use crate::server::auth::{AuthError, AuthState, PermType};
use kvcore::alarm::AlarmState;
use kvcore::apply::codec::RaftOp;
use kvcore::apply::Node;
use kvcore::error::Error;
use kvcore::leaseread::LeaseReadCoordinator;
use kvcore::raft::{RaftHandle, SingleNodeRaft};
use kvcore::storage::engine::Engine;
use kvcore::storage::memory::ShardedMemory;
use kvcore::storage::persistent::Persistent;

use crate::pb::etcdserverpb::auth_server::AuthServer;
use crate::pb::etcdserverpb::cluster_server::ClusterServer;
use crate::pb::etcdserverpb::kv_server::KvServer;
use crate::pb::etcdserverpb::lease_server::LeaseServer;
use crate::pb::etcdserverpb::maintenance_server::MaintenanceServer;
use crate::pb::etcdserverpb::watch_server::WatchServer;
use crate::pb::etcdserverpb::ResponseHeader;
use crate::server::config::{ConfigLoad, EngineKind};

/// Stable for the life of the cluster. Real multi-cluster deployments would
/// persist a randomly chosen id; nothing here depends on more than its
/// stability and uniqueness within a deployment.
const CLUSTER_ID: u64 = 1;

/// State shared across every tonic service: the apply-loop handle, the
/// per-member alarm set, and the lease-read grant tracker.
pub struct Shared {
    pub node: Arc<Node>,
    pub alarms: Mutex<AlarmState>,
    pub lease_read: LeaseReadCoordinator,
    pub node_id: u64,
    pub lease_duration: Duration,
    pub client_listen_url: String,
    pub peer_listen_url: String,
    pub auth: Mutex<AuthState>,
}

pub(crate) fn header(shared: &Shared) -> ResponseHeader {
    ResponseHeader {
        cluster_id: CLUSTER_ID,
        member_id: shared.node_id,
        revision: shared.node.current_revision(),
        raft_term: 0,
    }
}

/// Maps a store error onto the `tonic::Status` code the etcd v3 client
/// contract expects for it.
pub(crate) fn to_status(err: Error) -> Status {
    match err {
        Error::KeyNotFound => Status::not_found(err.to_string()),
        Error::Compacted { .. } => Status::out_of_range(err.to_string()),
        Error::FutureRev { .. } => Status::out_of_range(err.to_string()),
        Error::LeaseNotFound { .. } => Status::not_found(err.to_string()),
        Error::LeaseExists { .. } => Status::already_exists(err.to_string()),
        Error::PermissionDenied(_) => Status::permission_denied(err.to_string()),
        Error::Unauthenticated(_) => Status::unauthenticated(err.to_string()),
        Error::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
        Error::Unavailable(_) => Status::unavailable(err.to_string()),
        Error::DeadlineExceeded => Status::deadline_exceeded(err.to_string()),
        Error::Canceled => Status::cancelled(err.to_string()),
        Error::ResourceExhausted(_) => Status::resource_exhausted(err.to_string()),
        Error::Internal(_) | Error::Encode(_) | Error::Decode(_) | Error::Io(_) => {
            Status::internal(err.to_string())
        }
    }
}

pub(crate) fn to_auth_status(err: AuthError) -> Status {
    match err {
        AuthError::UnknownUser(_) | AuthError::UnknownRole(_) => Status::not_found(err.to_string()),
        AuthError::InvalidCredentials | AuthError::InvalidToken => {
            Status::unauthenticated(err.to_string())
        }
        AuthError::NotEnabled => Status::failed_precondition(err.to_string()),
        AuthError::PermissionDenied => Status::permission_denied(err.to_string()),
    }
}

/// Pulls the bearer token etcd clients send under the `token` metadata key.
/// Absent entirely while auth is disabled; `check_permission` treats an
/// empty token as invalid once auth is enabled, which is the behavior we
/// want for a request that never authenticated.
pub(crate) fn bearer_token<T>(request: &tonic::Request<T>) -> String {
    request.metadata().get("token").and_then(|v| v.to_str().ok()).unwrap_or("").to_string()
}

/// Enforces that `token`'s user holds a grant covering `[key, range_end)`
/// for `want`. A no-op while auth is disabled.
pub(crate) fn require_permission(
    shared: &Shared,
    token: &str,
    want: PermType,
    key: &[u8],
    range_end: &[u8],
) -> Result<(), Status> {
    shared
        .auth
        .lock()
        .expect("auth state lock poisoned")
        .check_permission(token, want, key, range_end)
        .map_err(to_auth_status)
}

/// Builds the apply-loop node, starts its background tasks, and serves
/// every etcd v3 surface over one tonic server. Runs until the server is
/// shut down or errors.
pub async fn run(cfg: ConfigLoad) -> Result<()> {
    let engine: Box<dyn Engine> = match cfg.engine {
        EngineKind::Memory => Box::new(ShardedMemory::new()),
        EngineKind::Persistent => Box::new(Persistent::new(cfg.data_dir())?),
    };
    let raft: Arc<dyn RaftHandle> = Arc::new(SingleNodeRaft::new());
    let node = Arc::new(Node::restore(engine, raft)?);
    tokio::spawn(node.clone().spawn_apply_loop());

    let node_id = if cfg.node_id != 0 { cfg.node_id } else { 1 };
    let shared = Arc::new(Shared {
        node,
        alarms: Mutex::new(AlarmState::new()),
        lease_read: LeaseReadCoordinator::new(cfg.total_nodes()),
        node_id,
        lease_duration: Duration::from_millis(cfg.lease_duration_millis.max(1)),
        client_listen_url: cfg.client_listen_url.clone(),
        peer_listen_url: cfg.peer_listen_url.clone(),
        auth: Mutex::new(AuthState::new()),
    });

    spawn_lease_expiry_ticker(shared.clone());
    spawn_token_sweep_ticker(shared.clone());
    if cfg.lease_read_enabled {
        spawn_lease_read_heartbeat(shared.clone());
    }

    let addr = cfg.client_listen_url.parse()?;
    log::info!("kvserverd listening on {addr}");

    Server::builder()
        .add_service(KvServer::new(kv_service::KvService::new(shared.clone())))
        .add_service(WatchServer::new(watch_service::WatchService::new(shared.clone())))
        .add_service(LeaseServer::new(lease_service::LeaseService::new(shared.clone())))
        .add_service(MaintenanceServer::new(maintenance_service::MaintenanceService::new(shared.clone())))
        .add_service(ClusterServer::new(cluster_service::ClusterService::new(shared.clone())))
        .add_service(AuthServer::new(auth_service::AuthService::new(shared.clone())))
        .serve(addr)
        .await?;

    Ok(())
}

/// Polls for expired leases once a second and proposes a Revoke for each
/// through the apply loop, so expiry itself is agreed on by every replica
/// rather than decided unilaterally by whichever node notices first.
fn spawn_lease_expiry_ticker(shared: Arc<Shared>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let now = Instant::now();
            let expired = shared.node.with_leases(|leases| leases.expired_leases(now));
            for id in expired {
                if let Err(err) = shared.node.propose(RaftOp::LeaseRevoke { id }).await {
                    log::warn!("failed to propose expiry revoke for lease {id}: {err}");
                }
            }
        }
    });
}

/// Sweeps expired auth tokens out of the active-token store once a minute,
/// so a long-lived server doesn't accumulate one entry per issued token
/// forever.
fn spawn_token_sweep_ticker(shared: Arc<Shared>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let removed = shared.auth.lock().expect("auth state lock poisoned").sweep_expired_tokens();
            if removed > 0 {
                log::debug!("swept {removed} expired auth tokens");
            }
        }
    });
}

/// Runs a quorum heartbeat every half lease-duration. Single-node clusters
/// are trivially their own quorum; a multi-node deployment would fan this
/// round out over the peer list and have each peer ack in response.
fn spawn_lease_read_heartbeat(shared: Arc<Shared>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(shared.lease_duration / 2);
        loop {
            interval.tick().await;
            let round = shared.lease_read.begin_round();
            if round.ack() {
                shared.lease_read.extend(shared.lease_duration, SystemTime::now());
            }
        }
    });
}
