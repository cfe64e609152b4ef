//! Hash chaining over log entries.
//!
//! `integrity_hash = SHA-256(canonical_json(entry without hash) ‖ previous_hash)`
//! where the first entry's predecessor is [`GENESIS_HASH`]. Canonical JSON
//! is the `serde_json` encoding: struct fields in declaration order and
//! context maps in sorted key order.

use sha2::{Digest, Sha256};

use super::entry::SecureLogEntry;
use crate::security::error::{Result, SecurityError};

/// Predecessor of the first entry in a chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Compute the chain hash for `entry` given its predecessor's hash.
pub fn entry_hash(entry: &SecureLogEntry, previous: &str) -> Result<String> {
    let mut unsigned = entry.clone();
    unsigned.integrity_hash = None;
    let canonical = serde_json::to_vec(&unsigned)?;

    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    hasher.update(previous.as_bytes());
    Ok(hex_encode(&hasher.finalize()))
}

/// Replay a chain from `anchor`. Returns the hash of the last chained entry.
///
/// Unchained entries are stepped over and leave the running hash as is.
/// Fails on the first entry that is unhashed or whose stored hash does not
/// match; everything from that entry on is untrusted.
pub fn verify_chain<'a>(
    entries: impl IntoIterator<Item = &'a SecureLogEntry>,
    anchor: &str,
) -> Result<String> {
    let mut previous = anchor.to_string();
    for entry in entries {
        if entry.unchained {
            if entry.integrity_hash.is_some() {
                return Err(SecurityError::IntegrityFailure {
                    sequence: entry.sequence,
                    reason: "hash on unchained entry".to_string(),
                });
            }
            continue;
        }
        let Some(stored) = entry.integrity_hash.as_deref() else {
            return Err(SecurityError::IntegrityFailure {
                sequence: entry.sequence,
                reason: "missing integrity hash".to_string(),
            });
        };
        let expected = entry_hash(entry, &previous)?;
        if expected != stored {
            return Err(SecurityError::IntegrityFailure {
                sequence: entry.sequence,
                reason: "hash mismatch".to_string(),
            });
        }
        previous = expected;
    }
    Ok(previous)
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::logger::LogLevel;
    use chrono::Utc;

    fn chain(n: u64) -> Vec<SecureLogEntry> {
        let mut previous = GENESIS_HASH.to_string();
        (0..n)
            .map(|i| {
                let mut entry = SecureLogEntry {
                    sequence: i,
                    timestamp: Utc::now(),
                    level: LogLevel::Info,
                    message: format!("entry {}", i),
                    context: Some(serde_json::json!({"b": 1, "a": [i]})),
                    filtered: false,
                    correlation_id: format!("c{}", i),
                    encrypted_ref: None,
                    unchained: false,
                    integrity_hash: None,
                };
                let hash = entry_hash(&entry, &previous).unwrap();
                entry.integrity_hash = Some(hash.clone());
                previous = hash;
                entry
            })
            .collect()
    }

    #[test]
    fn intact_chain_verifies() {
        let entries = chain(5);
        let last = verify_chain(&entries, GENESIS_HASH).unwrap();
        assert_eq!(Some(last.as_str()), entries[4].integrity_hash.as_deref());
    }

    #[test]
    fn mutation_invalidates_from_that_entry() {
        for target in 0..6 {
            let mut entries = chain(6);
            entries[target].message.push('!');

            let err = verify_chain(&entries, GENESIS_HASH).unwrap_err();
            assert!(matches!(
                err,
                SecurityError::IntegrityFailure { sequence, .. } if sequence == target as u64
            ));
            // Everything before the mutation still replays.
            assert!(verify_chain(&entries[..target], GENESIS_HASH).is_ok());
        }
    }

    #[test]
    fn stripped_hash_is_a_failure() {
        let mut entries = chain(3);
        entries[2].integrity_hash = None;
        assert!(verify_chain(&entries, GENESIS_HASH).is_err());
    }

    #[test]
    fn unchained_entries_are_stepped_over() {
        let mut entries = chain(2);
        let mut gap = entries[1].clone();
        gap.sequence = 1;
        gap.message = "logged with chaining off".into();
        gap.unchained = true;
        gap.integrity_hash = None;
        entries.insert(1, gap);
        // Relink the trailing entry onto the first one.
        entries[2].sequence = 2;
        entries[2].integrity_hash = None;
        let relinked = entry_hash(&entries[2], entries[0].integrity_hash.as_deref().unwrap()).unwrap();
        entries[2].integrity_hash = Some(relinked);

        assert!(verify_chain(&entries, GENESIS_HASH).is_ok());
    }

    #[test]
    fn marking_a_chained_entry_unchained_breaks_the_next_link() {
        let mut entries = chain(3);
        entries[1].unchained = true;
        entries[1].integrity_hash = None;

        let err = verify_chain(&entries, GENESIS_HASH).unwrap_err();
        assert!(matches!(err, SecurityError::IntegrityFailure { sequence: 2, .. }));
    }

    #[test]
    fn serialization_round_trip_preserves_hash() {
        let entries = chain(3);
        let reparsed: Vec<SecureLogEntry> = entries
            .iter()
            .map(|e| serde_json::from_str(&serde_json::to_string(e).unwrap()).unwrap())
            .collect();
        assert!(verify_chain(&reparsed, GENESIS_HASH).is_ok());
    }
}
