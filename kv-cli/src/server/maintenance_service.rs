use std::ops::Bound;
use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::{Request, Response, Status};

use kvcore::alarm::AlarmType;
use kvcore::storage::engine::Engine;
use kvcore::storage::persistent::keyspace;

use crate::pb::etcdserverpb::alarm_request::{AlarmAction, AlarmType as PbAlarmType};
use crate::pb::etcdserverpb::maintenance_server::Maintenance;
use crate::pb::etcdserverpb::{
    AlarmMember, AlarmRequest, AlarmResponse, DefragmentRequest, DefragmentResponse, HashKvRequest,
    HashKvResponse, HashRequest, HashResponse, MoveLeaderRequest, MoveLeaderResponse, SnapshotRequest,
    SnapshotResponse, StatusRequest, StatusResponse,
};
use crate::server::{header, to_status, Shared};

pub struct MaintenanceService {
    shared: Arc<Shared>,
}

impl MaintenanceService {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }
}

fn kv_keyspace_bounds() -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    keyspace::bounds(keyspace::KV)
}

/// Default chunk size for a streamed `Snapshot` response, matching etcd's.
const SNAPSHOT_CHUNK_BYTES: usize = 4 * 1024 * 1024;

#[tonic::async_trait]
impl Maintenance for MaintenanceService {
    async fn status(&self, _request: Request<StatusRequest>) -> Result<Response<StatusResponse>, Status> {
        let status = self.shared.node.with_engine(|engine| engine.status()).map_err(to_status)?;
        Ok(Response::new(StatusResponse {
            header: Some(header(&self.shared)),
            version: env!("CARGO_PKG_VERSION").to_string(),
            db_size: status.total_disk_size,
            is_learner: false,
        }))
    }

    async fn hash(&self, _request: Request<HashRequest>) -> Result<Response<HashResponse>, Status> {
        let hash = self.shared.node.with_engine(|engine| {
            let mut hasher = crc32fast::Hasher::new();
            for entry in engine.scan_dyn(kv_keyspace_bounds()) {
                let (key, value) = entry?;
                hasher.update(&key);
                hasher.update(&value);
            }
            kvcore::error::CResult::Ok(hasher.finalize())
        }).map_err(to_status)?;
        Ok(Response::new(HashResponse { header: Some(header(&self.shared)), hash }))
    }

    async fn hash_kv(
        &self,
        request: Request<HashKvRequest>,
    ) -> Result<Response<HashKvResponse>, Status> {
        let req = request.into_inner();
        let current = self.shared.node.current_revision();
        if req.revision > 0 && req.revision != current {
            return Err(to_status(kvcore::error::Error::Compacted { compact_revision: current }));
        }
        let hash = self.shared.node.with_engine(|engine| {
            let mut hasher = crc32fast::Hasher::new();
            for entry in engine.scan_dyn(kv_keyspace_bounds()) {
                let (key, value) = entry?;
                hasher.update(&key);
                hasher.update(&value);
            }
            kvcore::error::CResult::Ok(hasher.finalize())
        }).map_err(to_status)?;
        Ok(Response::new(HashKvResponse {
            header: Some(header(&self.shared)),
            hash,
            compact_revision: 0,
        }))
    }

    async fn alarm(&self, request: Request<AlarmRequest>) -> Result<Response<AlarmResponse>, Status> {
        let req = request.into_inner();
        let alarm_type = match PbAlarmType::try_from(req.alarm).unwrap_or(PbAlarmType::None) {
            PbAlarmType::Nospace => Some(AlarmType::NoSpace),
            PbAlarmType::None => None,
        };
        let mut alarms = self.shared.alarms.lock().expect("alarm state lock poisoned");
        match AlarmAction::try_from(req.action).unwrap_or(AlarmAction::Get) {
            AlarmAction::Get => {}
            AlarmAction::Activate => {
                if let Some(kind) = alarm_type {
                    alarms.activate(req.member_id, kind);
                }
            }
            AlarmAction::Deactivate => {
                if let Some(kind) = alarm_type {
                    alarms.deactivate(req.member_id, kind);
                }
            }
        }
        let active = alarms
            .list()
            .into_iter()
            .map(|(member_id, _)| AlarmMember { member_id, alarm: PbAlarmType::Nospace as i32 })
            .collect();
        Ok(Response::new(AlarmResponse { header: Some(header(&self.shared)), alarms: active }))
    }

    type SnapshotStream = Pin<Box<dyn Stream<Item = Result<SnapshotResponse, Status>> + Send + 'static>>;

    async fn snapshot(
        &self,
        _request: Request<SnapshotRequest>,
    ) -> Result<Response<Self::SnapshotStream>, Status> {
        let blob = self.shared.node.with_engine(|engine| engine.snapshot()).map_err(to_status)?;
        let header = header(&self.shared);
        let (tx, rx) = tokio::sync::mpsc::channel(4);

        tokio::spawn(async move {
            let total = blob.len();
            let mut offset = 0;
            loop {
                let end = (offset + SNAPSHOT_CHUNK_BYTES).min(total);
                let chunk = blob[offset..end].to_vec();
                offset = end;
                let remaining_bytes = (total - offset) as u64;
                let response =
                    SnapshotResponse { header: Some(header.clone()), remaining_bytes, blob: chunk };
                if tx.send(Ok(response)).await.is_err() {
                    return;
                }
                if offset >= total {
                    return;
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn defragment(
        &self,
        _request: Request<DefragmentRequest>,
    ) -> Result<Response<DefragmentResponse>, Status> {
        self.shared.node.with_engine(|engine| engine.defragment()).map_err(to_status)?;
        Ok(Response::new(DefragmentResponse { header: Some(header(&self.shared)) }))
    }

    async fn move_leader(
        &self,
        _request: Request<MoveLeaderRequest>,
    ) -> Result<Response<MoveLeaderResponse>, Status> {
        // Single-node deployments have no leadership to transfer.
        Ok(Response::new(MoveLeaderResponse { header: Some(header(&self.shared)) }))
    }
}
