//! Deterministic event ids for command-derived appends (§4.3).

use sha2::{Digest, Sha256};

/// `SHA-256(command_id || ':' || aggregate_id || ':' || sequence_in_command)`,
/// truncated to 128 bits and hex-encoded. Retried appends of the same
/// command against the same aggregate therefore produce byte-identical
/// event ids, which lets the log's idempotent path rely on receipts rather
/// than a full payload comparison.
pub fn derive_event_id(command_id: &str, aggregate_id: &str, sequence_in_command: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(command_id.as_bytes());
    hasher.update(b":");
    hasher.update(aggregate_id.as_bytes());
    hasher.update(b":");
    hasher.update(sequence_in_command.to_string().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}
