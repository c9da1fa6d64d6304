// Content-based event identity. Two events with the same fingerprint are the
// same logical occurrence regardless of message wording.

use sha2::{Sha256, Digest};
use std::fmt;

use crate::config::FingerprintConfig;
use crate::events::CandidateEvent;

/// First 16 bytes of a SHA-256 over the normalized identity fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    pub(crate) fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Stable index of this fingerprint into `shards` lock domains.
    pub fn shard(&self, shards: usize) -> usize {
        // First 8 bytes as a u64; the hash is already uniform.
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[..8]);
        (u64::from_be_bytes(buf) % shards as u64) as usize
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Derives fingerprints from candidate events.
///
/// Hashes source, category, severity, event type, the resource reference and
/// the configured critical detail fields. Message text and timestamps are
/// deliberately excluded so superficial variation does not defeat dedup.
pub struct FingerprintBuilder {
    critical_fields: Vec<String>,
}

impl FingerprintBuilder {
    pub fn new(config: FingerprintConfig) -> Self {
        Self {
            critical_fields: config.critical_fields,
        }
    }

    /// Compute the fingerprint for an event. Never fails: missing fields
    /// hash as empty values, so even a fully degenerate event gets a
    /// deterministic fingerprint (degenerate inputs may collide, which is
    /// acceptable since they carry no identity).
    pub fn fingerprint(&self, event: &CandidateEvent) -> Fingerprint {
        let mut hasher = Sha256::new();

        // Field separators keep ("ab", "c") distinct from ("a", "bc").
        hash_field(&mut hasher, &event.source);
        hash_field(&mut hasher, &event.category);
        hash_field(&mut hasher, event.severity.as_str());
        hash_field(&mut hasher, &event.event_type);
        hash_field(&mut hasher, &event.resource.kind);
        hash_field(&mut hasher, &event.resource.name);
        hash_field(&mut hasher, &event.resource.namespace);

        // Critical details in configured order so the result is independent
        // of HashMap iteration order.
        for field in &self.critical_fields {
            if let Some(value) = event.details.get(field) {
                hash_field(&mut hasher, field);
                hash_field(&mut hasher, value);
            }
        }

        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Fingerprint::from_bytes(bytes)
    }
}

fn hash_field(hasher: &mut Sha256, value: &str) {
    hasher.update(value.as_bytes());
    hasher.update([0u8]);
}
