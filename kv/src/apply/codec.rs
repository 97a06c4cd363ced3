use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::txn::TxnRequest;

/// One mutating operation as it travels through the replicated log. Reads
/// never go through here -- only the apply loop's own classification of
/// "this needs a revision" determines what gets proposed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftOp {
    Put { key: Vec<u8>, value: Vec<u8>, lease: i64 },
    DeleteRange { key: Vec<u8>, range_end: Vec<u8> },
    Txn(TxnRequest),
    LeaseGrant { id: i64, ttl_secs: i64 },
    LeaseRevoke { id: i64 },
    Compact { revision: i64 },
}

/// Wraps a `RaftOp` with the sequence number the proposing node assigned it,
/// so that node (and only that node) can match the committed entry back to
/// the caller waiting on it. The sequence number has no meaning to any other
/// replica and is never used to order or deduplicate anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    pub op: RaftOp,
}

/// Tag byte for the current wire format. Bumped if the encoding changes in
/// a way existing log entries wouldn't decode under.
const FORMAT_TAG: u8 = 1;

/// Encodes an envelope as a tag byte followed by its bincode encoding.
pub fn encode(envelope: &Envelope) -> CResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    buf.push(FORMAT_TAG);
    bincode::serialize_into(&mut buf, envelope).map_err(|e| Error::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decodes an envelope, accepting both the current tagged format and a bare
/// (untagged) legacy encoding for entries written before the tag byte was
/// introduced. Tries the current format first and only falls back to the
/// legacy form if that fails to parse.
pub fn decode(bytes: &[u8]) -> CResult<Envelope> {
    if let Some((&tag, rest)) = bytes.split_first() {
        if tag == FORMAT_TAG {
            if let Ok(envelope) = bincode::deserialize::<Envelope>(rest) {
                return Ok(envelope);
            }
        }
    }
    bincode::deserialize::<Envelope>(bytes).map_err(|e| Error::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_put() {
        let envelope = Envelope { seq: 7, op: RaftOp::Put { key: b"a".to_vec(), value: vec![1], lease: 0 } };
        let bytes = encode(&envelope).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.seq, 7);
        assert!(matches!(decoded.op, RaftOp::Put { .. }));
    }

    #[test]
    fn decodes_legacy_untagged_payloads() {
        let envelope = Envelope { seq: 3, op: RaftOp::LeaseRevoke { id: 9 } };
        let legacy_bytes = bincode::serialize(&envelope).unwrap();
        let decoded = decode(&legacy_bytes).unwrap();
        assert_eq!(decoded.seq, 3);
        assert!(matches!(decoded.op, RaftOp::LeaseRevoke { id: 9 }));
    }
}
