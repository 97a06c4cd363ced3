use std::sync::Arc;
use std::time::SystemTime;

use tonic::{Request, Response, Status};

use kvcore::apply::codec::RaftOp;
use kvcore::apply::ApplyOutcome;
use kvcore::error::Error;
use kvcore::kvstore::KeyRecord;
use kvcore::txn as core_txn;

use crate::pb::etcdserverpb::compare::{CompareResult as PbCompareResult, CompareTarget, TargetUnion};
use crate::pb::etcdserverpb::kv_server::Kv;
use crate::pb::etcdserverpb::request_op::Request as PbOpRequest;
use crate::pb::etcdserverpb::response_op::Response as PbOpResponse;
use crate::pb::etcdserverpb::{
    Compare, CompactionRequest, CompactionResponse, DeleteRangeRequest, DeleteRangeResponse, KeyValue,
    PutRequest, PutResponse, RangeRequest, RangeResponse, RequestOp, ResponseOp, TxnRequest, TxnResponse,
};
use crate::server::auth::PermType;
use crate::server::{bearer_token, header, require_permission, to_status, Shared};

pub struct KvService {
    shared: Arc<Shared>,
}

impl KvService {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }
}

fn to_keyvalue(key: Vec<u8>, record: &KeyRecord) -> KeyValue {
    KeyValue {
        key,
        create_revision: record.create_revision,
        mod_revision: record.mod_revision,
        version: record.version,
        value: record.value.clone(),
        lease: record.lease,
    }
}

fn pb_compare_to_core(compare: &Compare) -> core_txn::Compare {
    let result = match PbCompareResult::try_from(compare.result).unwrap_or(PbCompareResult::Equal) {
        PbCompareResult::Equal => core_txn::CompareResult::Equal,
        PbCompareResult::Greater => core_txn::CompareResult::Greater,
        PbCompareResult::Less => core_txn::CompareResult::Less,
        PbCompareResult::NotEqual => core_txn::CompareResult::NotEqual,
    };
    let target_value = match compare.target_union.clone() {
        Some(TargetUnion::Version(v)) => core_txn::TargetValue::Version(v),
        Some(TargetUnion::CreateRevision(v)) => core_txn::TargetValue::CreateRevision(v),
        Some(TargetUnion::ModRevision(v)) => core_txn::TargetValue::ModRevision(v),
        Some(TargetUnion::Value(v)) => core_txn::TargetValue::Value(v),
        Some(TargetUnion::Lease(v)) => core_txn::TargetValue::Lease(v),
        None => match CompareTarget::try_from(compare.target).unwrap_or(CompareTarget::Version) {
            CompareTarget::Version => core_txn::TargetValue::Version(0),
            CompareTarget::Create => core_txn::TargetValue::CreateRevision(0),
            CompareTarget::Mod => core_txn::TargetValue::ModRevision(0),
            CompareTarget::Value => core_txn::TargetValue::Value(Vec::new()),
            CompareTarget::Lease => core_txn::TargetValue::Lease(0),
        },
    };
    core_txn::Compare { key: compare.key.clone(), result, target_value }
}

fn pb_op_to_core(op: &RequestOp) -> Result<core_txn::Op, Status> {
    match &op.request {
        Some(PbOpRequest::RequestRange(r)) => {
            let limit = if r.limit < 0 { 0 } else { r.limit as usize };
            Ok(core_txn::Op::Range { key: r.key.clone(), range_end: r.range_end.clone(), limit })
        }
        Some(PbOpRequest::RequestPut(p)) => {
            Ok(core_txn::Op::Put { key: p.key.clone(), value: p.value.clone(), lease: p.lease })
        }
        Some(PbOpRequest::RequestDeleteRange(d)) => {
            Ok(core_txn::Op::DeleteRange { key: d.key.clone(), range_end: d.range_end.clone() })
        }
        Some(PbOpRequest::RequestTxn(t)) => Ok(core_txn::Op::Txn(pb_txn_to_core(t)?)),
        None => Err(Status::invalid_argument("empty RequestOp")),
    }
}

fn pb_txn_to_core(txn: &TxnRequest) -> Result<core_txn::TxnRequest, Status> {
    Ok(core_txn::TxnRequest {
        compare: txn.compare.iter().map(pb_compare_to_core).collect(),
        success: txn.success.iter().map(pb_op_to_core).collect::<Result<_, _>>()?,
        failure: txn.failure.iter().map(pb_op_to_core).collect::<Result<_, _>>()?,
    })
}

fn core_op_response_to_pb(response: core_txn::OpResponse) -> ResponseOp {
    let inner = match response {
        core_txn::OpResponse::Range(results) => PbOpResponse::ResponseRange(crate::pb::etcdserverpb::RangeResponse {
            header: None,
            count: results.len() as i64,
            more: false,
            kvs: results.into_iter().map(|(k, r)| to_keyvalue(k, &r)).collect(),
        }),
        core_txn::OpResponse::Put(key, record) => {
            let _ = (key, record);
            PbOpResponse::ResponsePut(PutResponse { header: None, prev_kv: None })
        }
        core_txn::OpResponse::DeleteRange(removed) => PbOpResponse::ResponseDeleteRange(DeleteRangeResponse {
            header: None,
            deleted: removed.len() as i64,
            prev_kvs: removed.into_iter().map(|(k, r)| to_keyvalue(k, &r)).collect(),
        }),
        core_txn::OpResponse::Txn(nested) => {
            PbOpResponse::ResponseTxn(core_txn_response_to_pb(nested, None))
        }
    };
    ResponseOp { response: Some(inner) }
}

/// Gathers every key-range a transaction's compares and ops touch, with the
/// permission each requires, recursing into nested transactions. Used so
/// the whole txn can be permission-checked up front, before any of it runs.
fn collect_permission_checks(txn: &TxnRequest, out: &mut Vec<(PermType, Vec<u8>, Vec<u8>)>) {
    for compare in &txn.compare {
        out.push((PermType::Read, compare.key.clone(), Vec::new()));
    }
    for op in txn.success.iter().chain(txn.failure.iter()) {
        match &op.request {
            Some(PbOpRequest::RequestRange(r)) => {
                out.push((PermType::Read, r.key.clone(), r.range_end.clone()))
            }
            Some(PbOpRequest::RequestPut(p)) => out.push((PermType::Write, p.key.clone(), Vec::new())),
            Some(PbOpRequest::RequestDeleteRange(d)) => {
                out.push((PermType::Write, d.key.clone(), d.range_end.clone()))
            }
            Some(PbOpRequest::RequestTxn(t)) => collect_permission_checks(t, out),
            None => {}
        }
    }
}

fn core_txn_response_to_pb(response: core_txn::TxnResponse, header: Option<crate::pb::etcdserverpb::ResponseHeader>) -> TxnResponse {
    TxnResponse {
        header,
        succeeded: response.succeeded,
        responses: response.responses.into_iter().map(core_op_response_to_pb).collect(),
    }
}

#[tonic::async_trait]
impl Kv for KvService {
    async fn range(&self, request: Request<RangeRequest>) -> Result<Response<RangeResponse>, Status> {
        let token = bearer_token(&request);
        let req = request.into_inner();
        require_permission(&self.shared, &token, PermType::Read, &req.key, &req.range_end)?;
        let current = self.shared.node.current_revision();
        if req.revision > current {
            return Err(to_status(Error::FutureRev { current_revision: current }));
        }
        if req.revision > 0 && req.revision != current {
            return Err(to_status(Error::Compacted { compact_revision: current }));
        }
        if !self.shared.node.is_leader() {
            return Err(to_status(Error::Unavailable("not the leader".into())));
        }
        // Serve locally only while the lease-read grant is valid; otherwise
        // confirm leadership with a quorum round before reading, the
        // read-index fallback the grant exists to let us skip.
        if !self.shared.lease_read.is_lease_read_valid(SystemTime::now()) {
            let round = self.shared.lease_read.begin_round();
            if round.ack() {
                self.shared.lease_read.extend(self.shared.lease_duration, SystemTime::now());
            }
        }

        let limit = if req.limit < 0 { 0 } else { req.limit as usize };
        let fetch_limit = if limit == 0 { 0 } else { limit + 1 };
        let mut results = self.shared.node.with_kv(|kv| kv.range(&req.key, &req.range_end, fetch_limit));
        let more = limit != 0 && results.len() > limit;
        if more {
            results.truncate(limit);
        }
        let kvs: Vec<KeyValue> = results.into_iter().map(|(k, r)| to_keyvalue(k, &r)).collect();
        let count = kvs.len() as i64;
        Ok(Response::new(RangeResponse { header: Some(header(&self.shared)), kvs, more, count }))
    }

    async fn put(&self, request: Request<PutRequest>) -> Result<Response<PutResponse>, Status> {
        let token = bearer_token(&request);
        let req = request.into_inner();
        require_permission(&self.shared, &token, PermType::Write, &req.key, &[])?;
        let want_prev = req.prev_kv;
        let outcome = self
            .shared
            .node
            .propose(RaftOp::Put { key: req.key, value: req.value, lease: req.lease })
            .await
            .map_err(to_status)?;
        match outcome {
            ApplyOutcome::Put { record, prev } => {
                let prev_kv = if want_prev {
                    prev.map(|p| {
                        let mut kv = to_keyvalue(Vec::new(), &p);
                        kv.version = record.version - 1;
                        kv
                    })
                } else {
                    None
                };
                Ok(Response::new(PutResponse { header: Some(header(&self.shared)), prev_kv }))
            }
            _ => Err(Status::internal("unexpected apply outcome for Put")),
        }
    }

    async fn delete_range(
        &self,
        request: Request<DeleteRangeRequest>,
    ) -> Result<Response<DeleteRangeResponse>, Status> {
        let token = bearer_token(&request);
        let req = request.into_inner();
        require_permission(&self.shared, &token, PermType::Write, &req.key, &req.range_end)?;
        let want_prev = req.prev_kv;
        let outcome = self
            .shared
            .node
            .propose(RaftOp::DeleteRange { key: req.key, range_end: req.range_end })
            .await
            .map_err(to_status)?;
        match outcome {
            ApplyOutcome::DeleteRange { deleted } => {
                let deleted_count = deleted.len() as i64;
                let prev_kvs = if want_prev {
                    deleted.into_iter().map(|(k, r)| to_keyvalue(k, &r)).collect()
                } else {
                    Vec::new()
                };
                Ok(Response::new(DeleteRangeResponse {
                    header: Some(header(&self.shared)),
                    deleted: deleted_count,
                    prev_kvs,
                }))
            }
            _ => Err(Status::internal("unexpected apply outcome for DeleteRange")),
        }
    }

    async fn txn(&self, request: Request<TxnRequest>) -> Result<Response<TxnResponse>, Status> {
        let token = bearer_token(&request);
        let req = request.into_inner();
        let mut checks = Vec::new();
        collect_permission_checks(&req, &mut checks);
        for (want, key, range_end) in &checks {
            require_permission(&self.shared, &token, *want, key, range_end)?;
        }
        let core_request = pb_txn_to_core(&req)?;
        let outcome = self.shared.node.propose(RaftOp::Txn(core_request)).await.map_err(to_status)?;
        match outcome {
            ApplyOutcome::Txn(response) => {
                Ok(Response::new(core_txn_response_to_pb(response, Some(header(&self.shared)))))
            }
            _ => Err(Status::internal("unexpected apply outcome for Txn")),
        }
    }

    async fn compact(&self, request: Request<CompactionRequest>) -> Result<Response<CompactionResponse>, Status> {
        let req = request.into_inner();
        let current = self.shared.node.current_revision();
        if req.revision > current {
            return Err(to_status(Error::FutureRev { current_revision: current }));
        }
        self.shared.node.propose(RaftOp::Compact { revision: req.revision }).await.map_err(to_status)?;
        Ok(Response::new(CompactionResponse { header: Some(header(&self.shared)) }))
    }
}
