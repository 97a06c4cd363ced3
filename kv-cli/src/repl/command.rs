use std::sync::Arc;
use std::time::Instant;

use kvcore::apply::codec::RaftOp;
use kvcore::apply::{ApplyOutcome, Node};

pub enum Outcome {
    Printed(String),
    Exit,
    Error(String),
}

fn ok(text: impl Into<String>) -> Outcome {
    Outcome::Printed(text.into())
}

fn err(text: impl std::fmt::Display) -> Outcome {
    Outcome::Error(text.to_string())
}

/// Parses and runs one REPL line against `node`. Recognized verbs: `SET`,
/// `GET`, `DEL`, `KEYS`, `KSIZE`, `LEASE GRANT`, `LEASE REVOKE`, `LEASE TTL`,
/// `exit`/`quit`. Unrecognized input is reported as an error rather than
/// silently ignored.
pub async fn dispatch(node: &Arc<Node>, line: &str) -> Outcome {
    let mut parts = line.split_whitespace();
    let verb = match parts.next() {
        Some(v) => v.to_uppercase(),
        None => return ok(""),
    };

    match verb.as_str() {
        "EXIT" | "QUIT" => Outcome::Exit,
        "SET" => {
            let (key, value) = match (parts.next(), parts.next()) {
                (Some(k), Some(v)) => (k, v),
                _ => return err("usage: SET <key> <value>"),
            };
            let op = RaftOp::Put { key: key.as_bytes().to_vec(), value: value.as_bytes().to_vec(), lease: 0 };
            match node.propose(op).await {
                Ok(ApplyOutcome::Put { .. }) => ok("OK ~"),
                Ok(_) => err("unexpected apply outcome"),
                Err(e) => err(e),
            }
        }
        "GET" => {
            let key = match parts.next() {
                Some(k) => k,
                None => return err("usage: GET <key>"),
            };
            let found = node.with_kv(|kv| kv.get(key.as_bytes()).cloned());
            match found {
                Some(record) => ok(String::from_utf8_lossy(&record.value).into_owned()),
                None => ok("N/A ~"),
            }
        }
        "DEL" => {
            let key = match parts.next() {
                Some(k) => k,
                None => return err("usage: DEL <key>"),
            };
            let op = RaftOp::DeleteRange { key: key.as_bytes().to_vec(), range_end: Vec::new() };
            match node.propose(op).await {
                Ok(ApplyOutcome::DeleteRange { .. }) => ok("OK ~"),
                Ok(_) => err("unexpected apply outcome"),
                Err(e) => err(e),
            }
        }
        "KEYS" => {
            // key = [0], range_end = [0] addresses every key in the store.
            let keys = node.with_kv(|kv| kv.range(&[0], &[0], 0));
            if keys.is_empty() {
                ok("")
            } else {
                ok(keys
                    .into_iter()
                    .map(|(k, _)| String::from_utf8_lossy(&k).into_owned())
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
        }
        "KSIZE" => {
            let len = node.with_kv(|kv| kv.len());
            ok(len.to_string())
        }
        "LEASE" => dispatch_lease(node, parts).await,
        other => err(format!("unknown command {other:?}")),
    }
}

async fn dispatch_lease(node: &Arc<Node>, mut parts: std::str::SplitWhitespace<'_>) -> Outcome {
    match parts.next().map(|s| s.to_uppercase()) {
        Some(sub) if sub == "GRANT" => {
            let ttl: i64 = match parts.next().and_then(|s| s.parse().ok()) {
                Some(ttl) => ttl,
                None => return err("usage: LEASE GRANT <ttl_secs>"),
            };
            match node.propose(RaftOp::LeaseGrant { id: 0, ttl_secs: ttl }).await {
                Ok(ApplyOutcome::LeaseGranted { id }) => ok(format!("lease {id} granted, ttl {ttl}s")),
                Ok(_) => err("unexpected apply outcome"),
                Err(e) => err(e),
            }
        }
        Some(sub) if sub == "REVOKE" => {
            let id: i64 = match parts.next().and_then(|s| s.parse().ok()) {
                Some(id) => id,
                None => return err("usage: LEASE REVOKE <id>"),
            };
            match node.propose(RaftOp::LeaseRevoke { id }).await {
                Ok(ApplyOutcome::LeaseRevoked { deleted_keys }) => {
                    ok(format!("lease {id} revoked, {} keys removed", deleted_keys.len()))
                }
                Ok(_) => err("unexpected apply outcome"),
                Err(e) => err(e),
            }
        }
        Some(sub) if sub == "TTL" => {
            let id: i64 = match parts.next().and_then(|s| s.parse().ok()) {
                Some(id) => id,
                None => return err("usage: LEASE TTL <id>"),
            };
            match node.with_leases(|leases| leases.time_to_live(id, Instant::now())) {
                Ok((granted, remaining, keys)) => {
                    ok(format!("granted {granted}s, remaining {remaining}s, {} keys", keys.len()))
                }
                Err(e) => err(e),
            }
        }
        _ => err("usage: LEASE GRANT|REVOKE|TTL ..."),
    }
}
