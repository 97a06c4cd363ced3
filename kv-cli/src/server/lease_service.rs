use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};

use kvcore::apply::codec::RaftOp;
use kvcore::apply::ApplyOutcome;

use crate::pb::etcdserverpb::lease_server::Lease;
use crate::pb::etcdserverpb::{
    LeaseGrantRequest, LeaseGrantResponse, LeaseKeepAliveRequest, LeaseKeepAliveResponse,
    LeaseLeasesRequest, LeaseLeasesResponse, LeaseRevokeRequest, LeaseRevokeResponse, LeaseStatus,
    LeaseTimeToLiveRequest, LeaseTimeToLiveResponse,
};
use crate::server::{header, to_status, Shared};

pub struct LeaseService {
    shared: Arc<Shared>,
}

impl LeaseService {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }
}

#[tonic::async_trait]
impl Lease for LeaseService {
    async fn lease_grant(
        &self,
        request: Request<LeaseGrantRequest>,
    ) -> Result<Response<LeaseGrantResponse>, Status> {
        let req = request.into_inner();
        let outcome = self
            .shared
            .node
            .propose(RaftOp::LeaseGrant { id: req.id, ttl_secs: req.ttl })
            .await
            .map_err(to_status)?;
        match outcome {
            ApplyOutcome::LeaseGranted { id } => {
                Ok(Response::new(LeaseGrantResponse { header: Some(header(&self.shared)), id, ttl: req.ttl }))
            }
            _ => Err(Status::internal("unexpected apply outcome for LeaseGrant")),
        }
    }

    async fn lease_revoke(
        &self,
        request: Request<LeaseRevokeRequest>,
    ) -> Result<Response<LeaseRevokeResponse>, Status> {
        let req = request.into_inner();
        self.shared.node.propose(RaftOp::LeaseRevoke { id: req.id }).await.map_err(to_status)?;
        Ok(Response::new(LeaseRevokeResponse { header: Some(header(&self.shared)) }))
    }

    type LeaseKeepAliveStream =
        Pin<Box<dyn Stream<Item = Result<LeaseKeepAliveResponse, Status>> + Send + 'static>>;

    async fn lease_keep_alive(
        &self,
        request: Request<Streaming<LeaseKeepAliveRequest>>,
    ) -> Result<Response<Self::LeaseKeepAliveStream>, Status> {
        let mut incoming = request.into_inner();
        let shared = self.shared.clone();
        let (tx, rx) = tokio::sync::mpsc::channel(16);

        tokio::spawn(async move {
            while let Some(Ok(req)) = incoming.next().await {
                let result = shared.node.with_leases_mut(|leases| leases.keep_alive(req.id, Instant::now()));
                let response = match result {
                    Ok(ttl) => {
                        Ok(LeaseKeepAliveResponse { header: Some(header(&shared)), id: req.id, ttl })
                    }
                    Err(err) => Err(to_status(err)),
                };
                if tx.send(response).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn lease_time_to_live(
        &self,
        request: Request<LeaseTimeToLiveRequest>,
    ) -> Result<Response<LeaseTimeToLiveResponse>, Status> {
        let req = request.into_inner();
        let (granted_ttl, ttl, keys) = self
            .shared
            .node
            .with_leases(|leases| leases.time_to_live(req.id, Instant::now()))
            .map_err(to_status)?;
        Ok(Response::new(LeaseTimeToLiveResponse {
            header: Some(header(&self.shared)),
            id: req.id,
            ttl,
            granted_ttl,
            keys: if req.keys { keys } else { Vec::new() },
        }))
    }

    async fn lease_leases(
        &self,
        _request: Request<LeaseLeasesRequest>,
    ) -> Result<Response<LeaseLeasesResponse>, Status> {
        let leases = self.shared.node.with_leases(|leases| leases.leases());
        Ok(Response::new(LeaseLeasesResponse {
            header: Some(header(&self.shared)),
            leases: leases.into_iter().map(|id| LeaseStatus { id }).collect(),
        }))
    }
}
