use std::collections::HashSet;

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::kvstore::{KeyRecord, KvState};
use crate::lease::LeaseManager;
use crate::revision::RevisionSource;

/// How deeply a transaction's success/failure branches may nest further
/// transactions. Matches the spec's "finite depth (>= 3)" requirement with
/// headroom.
const MAX_TXN_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareResult {
    Equal,
    NotEqual,
    Greater,
    Less,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TargetValue {
    Version(i64),
    CreateRevision(i64),
    ModRevision(i64),
    Value(Vec<u8>),
    Lease(i64),
}

/// A single comparison against the current record for `key`. A key with no
/// record compares against the zero value for whichever target is named
/// (version/create/mod revision 0, empty value, lease 0).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compare {
    pub key: Vec<u8>,
    pub result: CompareResult,
    pub target_value: TargetValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Op {
    Range { key: Vec<u8>, range_end: Vec<u8>, limit: usize },
    Put { key: Vec<u8>, value: Vec<u8>, lease: i64 },
    DeleteRange { key: Vec<u8>, range_end: Vec<u8> },
    Txn(TxnRequest),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxnRequest {
    pub compare: Vec<Compare>,
    pub success: Vec<Op>,
    pub failure: Vec<Op>,
}

#[derive(Debug, Clone)]
pub enum OpResponse {
    Range(Vec<(Vec<u8>, KeyRecord)>),
    Put(Vec<u8>, KeyRecord),
    DeleteRange(Vec<(Vec<u8>, KeyRecord)>),
    Txn(TxnResponse),
}

#[derive(Debug, Clone)]
pub struct TxnResponse {
    pub succeeded: bool,
    pub responses: Vec<OpResponse>,
}

fn cmp_i64(actual: i64, want: i64, result: CompareResult) -> bool {
    match result {
        CompareResult::Equal => actual == want,
        CompareResult::NotEqual => actual != want,
        CompareResult::Greater => actual > want,
        CompareResult::Less => actual < want,
    }
}

fn cmp_bytes(actual: &[u8], want: &[u8], result: CompareResult) -> bool {
    match result {
        CompareResult::Equal => actual == want,
        CompareResult::NotEqual => actual != want,
        CompareResult::Greater => actual > want,
        CompareResult::Less => actual < want,
    }
}

fn eval_compare(kv: &KvState, compare: &Compare) -> bool {
    let record = kv.get(&compare.key);
    match &compare.target_value {
        TargetValue::Version(want) => {
            cmp_i64(record.map_or(0, |r| r.version), *want, compare.result)
        }
        TargetValue::CreateRevision(want) => {
            cmp_i64(record.map_or(0, |r| r.create_revision), *want, compare.result)
        }
        TargetValue::ModRevision(want) => {
            cmp_i64(record.map_or(0, |r| r.mod_revision), *want, compare.result)
        }
        TargetValue::Lease(want) => cmp_i64(record.map_or(0, |r| r.lease), *want, compare.result),
        TargetValue::Value(want) => {
            cmp_bytes(record.map_or(&[][..], |r| r.value.as_slice()), want, compare.result)
        }
    }
}

/// Evaluates and applies a transaction request against a key index, in the
/// context of one apply-loop step. At most one revision is allocated for the
/// whole call tree, and only if some executed branch actually mutates state.
pub struct TxnExecutor<'a> {
    kv: &'a mut KvState,
    leases: &'a mut LeaseManager,
    revisions: &'a RevisionSource,
    allocated: Option<i64>,
    touched_leases: HashSet<i64>,
}

impl<'a> TxnExecutor<'a> {
    pub fn new(kv: &'a mut KvState, leases: &'a mut LeaseManager, revisions: &'a RevisionSource) -> Self {
        Self { kv, leases, revisions, allocated: None, touched_leases: HashSet::new() }
    }

    pub fn execute(&mut self, txn: &TxnRequest) -> CResult<TxnResponse> {
        self.execute_depth(txn, 0)
    }

    /// The revision recorded for this call's mutations, if any were made.
    pub fn revision(&self) -> Option<i64> {
        self.allocated
    }

    /// Ids of leases whose bound-key set changed during this call, so the
    /// caller can re-persist their durable record.
    pub fn touched_leases(&self) -> &HashSet<i64> {
        &self.touched_leases
    }

    fn alloc_revision(&mut self) -> i64 {
        *self.allocated.get_or_insert_with(|| self.revisions.next())
    }

    fn execute_depth(&mut self, txn: &TxnRequest, depth: usize) -> CResult<TxnResponse> {
        if depth > MAX_TXN_DEPTH {
            return Err(Error::InvalidArgument("transaction nesting too deep".into()));
        }
        let succeeded = txn.compare.iter().all(|c| eval_compare(self.kv, c));
        let branch = if succeeded { &txn.success } else { &txn.failure };
        let mut responses = Vec::with_capacity(branch.len());
        for op in branch {
            responses.push(self.execute_op(op, depth)?);
        }
        Ok(TxnResponse { succeeded, responses })
    }

    fn execute_op(&mut self, op: &Op, depth: usize) -> CResult<OpResponse> {
        match op {
            Op::Range { key, range_end, limit } => {
                Ok(OpResponse::Range(self.kv.range(key, range_end, *limit)))
            }
            Op::Put { key, value, lease } => {
                if *lease != 0 {
                    self.leases.attach(*lease, key)?;
                    self.touched_leases.insert(*lease);
                }
                let revision = self.alloc_revision();
                let (record, prev) = self.kv.put(key, value.clone(), *lease, revision);
                if let Some(prev) = &prev {
                    if prev.lease != 0 && prev.lease != *lease {
                        self.leases.detach(prev.lease, key);
                        self.touched_leases.insert(prev.lease);
                    }
                }
                Ok(OpResponse::Put(key.clone(), record))
            }
            Op::DeleteRange { key, range_end } => {
                self.alloc_revision();
                let removed = self.kv.delete_range(key, range_end);
                for (k, record) in &removed {
                    if record.lease != 0 {
                        self.leases.detach(record.lease, k);
                        self.touched_leases.insert(record.lease);
                    }
                }
                Ok(OpResponse::DeleteRange(removed))
            }
            Op::Txn(nested) => Ok(OpResponse::Txn(self.execute_depth(nested, depth + 1)?)),
        }
    }
}
