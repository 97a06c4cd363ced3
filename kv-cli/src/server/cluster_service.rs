use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::pb::etcdserverpb::cluster_server::Cluster;
use crate::pb::etcdserverpb::{
    Member, MemberAddRequest, MemberAddResponse, MemberListRequest, MemberListResponse,
    MemberPromoteRequest, MemberPromoteResponse, MemberRemoveRequest, MemberRemoveResponse,
    MemberUpdateRequest, MemberUpdateResponse,
};
use crate::server::{header, to_status, Shared};

pub struct ClusterService {
    shared: Arc<Shared>,
}

impl ClusterService {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// This deployment's only member, since membership changes beyond it
    /// are rejected by `SingleNodeRaft`.
    fn self_member(&self) -> Member {
        Member {
            id: self.shared.node_id,
            name: format!("node-{}", self.shared.node_id),
            peer_urls: vec![self.shared.peer_listen_url.clone()],
            client_urls: vec![self.shared.client_listen_url.clone()],
            is_learner: false,
        }
    }
}

#[tonic::async_trait]
impl Cluster for ClusterService {
    async fn member_add(
        &self,
        request: Request<MemberAddRequest>,
    ) -> Result<Response<MemberAddResponse>, Status> {
        let req = request.into_inner();
        let address = req.peer_urls.first().cloned().unwrap_or_default();
        self.shared.node.add_member(0, address).map_err(to_status)?;
        Ok(Response::new(MemberAddResponse {
            header: Some(header(&self.shared)),
            member: Some(self.self_member()),
            members: vec![self.self_member()],
        }))
    }

    async fn member_remove(
        &self,
        request: Request<MemberRemoveRequest>,
    ) -> Result<Response<MemberRemoveResponse>, Status> {
        let req = request.into_inner();
        self.shared.node.remove_member(req.id).map_err(to_status)?;
        Ok(Response::new(MemberRemoveResponse {
            header: Some(header(&self.shared)),
            members: vec![self.self_member()],
        }))
    }

    async fn member_update(
        &self,
        _request: Request<MemberUpdateRequest>,
    ) -> Result<Response<MemberUpdateResponse>, Status> {
        Err(Status::unimplemented("member updates require a multi-member consensus group"))
    }

    async fn member_list(
        &self,
        _request: Request<MemberListRequest>,
    ) -> Result<Response<MemberListResponse>, Status> {
        Ok(Response::new(MemberListResponse {
            header: Some(header(&self.shared)),
            members: vec![self.self_member()],
        }))
    }

    async fn member_promote(
        &self,
        _request: Request<MemberPromoteRequest>,
    ) -> Result<Response<MemberPromoteResponse>, Status> {
        Err(Status::unimplemented("no learners exist in a single-node deployment"))
    }
}
