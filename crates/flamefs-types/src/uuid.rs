use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A 128-bit identifier used for clients, sessions, requests and directory
/// entries. Stored as two u64 halves; the 16-byte big-endian form is the
/// canonical key encoding.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Uuid {
    pub high: u64,
    pub low: u64,
}

impl Uuid {
    pub const ZERO: Uuid = Uuid { high: 0, low: 0 };

    pub fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }

    /// Generate a process-unique identifier. Mixes the current time with a
    /// process-wide counter so two calls never collide within a process and
    /// are overwhelmingly unlikely to collide across processes.
    pub fn generate() -> Self {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(0) as u64;
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        Self {
            high: nanos,
            low: seq.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (std::process::id() as u64),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.high == 0 && self.low == 0
    }

    /// Canonical 16-byte big-endian encoding.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.high.to_be_bytes());
        out[8..].copy_from_slice(&self.low.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self {
            high: u64::from_be_bytes(bytes[..8].try_into().unwrap()),
            low: u64::from_be_bytes(bytes[8..].try_into().unwrap()),
        }
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{:016x}", self.high, self.low)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_roundtrip() {
        let u = Uuid::new(0x0123_4567_89AB_CDEF, 0xFEDC_BA98_7654_3210);
        assert_eq!(Uuid::from_bytes(u.to_bytes()), u);
    }

    #[test]
    fn test_bytes_big_endian() {
        let u = Uuid::new(1, 2);
        let bytes = u.to_bytes();
        assert_eq!(bytes[7], 1);
        assert_eq!(bytes[15], 2);
    }

    #[test]
    fn test_generate_unique() {
        let a = Uuid::generate();
        let b = Uuid::generate();
        assert_ne!(a, b);
        assert!(!a.is_zero());
    }

    #[test]
    fn test_zero() {
        assert!(Uuid::ZERO.is_zero());
        assert!(Uuid::default().is_zero());
    }

    #[test]
    fn test_display() {
        let u = Uuid::new(0xAB, 0xCD);
        assert_eq!(format!("{}", u), "00000000000000ab-00000000000000cd");
    }
}
