//! Record digests and partition derivation.
//!
//! A digest is a RIPEMD-160 hash over the set name, the key's particle type
//! and the key bytes. The server computes the same hash, so the digest both
//! addresses the record and decides which partition owns it.

use std::fmt;

use ripemd::{Digest as _, Ripemd160};

use crate::error::{Error, Result};
use crate::value::Value;

pub const DIGEST_LEN: usize = 20;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

/// Computes the digest of `key` within `set`.
///
/// Only integer, string and blob keys are addressable.
pub fn digest(set: &str, key: &Value) -> Result<Digest> {
    match key {
        Value::Int(_) | Value::Str(_) | Value::Blob(_) => {}
        Value::Nil => return Err(Error::client("nil cannot be used as a key")),
        Value::Float(_) => return Err(Error::client("float cannot be used as a key")),
    }

    let mut hasher = Ripemd160::new();
    hasher.update(set.as_bytes());
    hasher.update([key.particle_type()]);
    hasher.update(key.to_bytes());

    let mut bytes = [0u8; DIGEST_LEN];
    bytes.copy_from_slice(&hasher.finalize());
    Ok(Digest(bytes))
}

/// Partition owning `digest` in a cluster with `n_partitions` partitions.
///
/// Reads the first four digest bytes as a little-endian integer, which for
/// the usual 4096 partitions is the server's low-12-bit mask. A count of zero
/// is treated as one, so every digest maps to partition 0.
pub fn partition_id(digest: &Digest, n_partitions: u32) -> u32 {
    let bytes = digest.as_bytes();
    let prefix = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    prefix % n_partitions.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic_and_set_scoped() {
        let a = digest("users", &Value::from("alice")).unwrap();
        let b = digest("users", &Value::from("alice")).unwrap();
        let c = digest("admins", &Value::from("alice")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn key_type_changes_digest() {
        let as_int = digest("s", &Value::Int(7)).unwrap();
        let as_str = digest("s", &Value::from("7")).unwrap();
        assert_ne!(as_int, as_str);
    }

    #[test]
    fn rejects_unaddressable_keys() {
        assert!(matches!(digest("s", &Value::Nil), Err(Error::Client(_))));
        assert!(matches!(digest("s", &Value::Float(1.5)), Err(Error::Client(_))));
    }

    #[test]
    fn partition_matches_server_mask() {
        let d = digest("test", &Value::from("key-1")).unwrap();
        let bytes = d.as_bytes();
        let masked = u16::from_le_bytes([bytes[0], bytes[1]]) as u32 & 0x0fff;
        assert_eq!(partition_id(&d, 4096), masked);
    }

    #[test]
    fn partition_id_is_stable() {
        let d = digest("test", &Value::Int(42)).unwrap();
        let first = partition_id(&d, 4096);
        for _ in 0..10 {
            assert_eq!(partition_id(&d, 4096), first);
        }
    }

    #[test]
    fn zero_partitions_maps_everything_to_zero() {
        let d = digest("test", &Value::Int(42)).unwrap();
        assert_eq!(partition_id(&d, 0), 0);
        assert_eq!(partition_id(&d, 1), 0);
    }

    #[test]
    fn partition_ids_spread_uniformly() {
        const N: u32 = 16;
        const SAMPLES: usize = 16_000;
        let mut buckets = [0usize; N as usize];
        for i in 0..SAMPLES {
            let d = digest("spread", &Value::Int(i as i64)).unwrap();
            let pid = partition_id(&d, N);
            assert!(pid < N);
            buckets[pid as usize] += 1;
        }
        // Expected 1000 per bucket; a loose band keeps this statistical check stable.
        for count in buckets {
            assert!((700..=1300).contains(&count), "skewed bucket: {count}");
        }
    }
}
