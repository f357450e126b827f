//! Lock/key handshake: derive the `$Key` answer to a `$Lock` challenge, and generate our own locks.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Prefix that tells the remote we speak the extended protocol (`$Supports`).
pub const EXTENDED_PROTOCOL: &str = "EXTENDEDPROTOCOL";

/// Bytes that cannot appear raw in a key and are sent as `/%DCN000%/`.
const RESERVED: [u8; 6] = [0, 5, 36, 96, 124, 126];

/// Derives a handshake key from a lock string. Pluggable so a session can be driven with another cipher.
pub trait KeyDerivation: Send + Sync {
    fn derive_key(&self, lock: &str) -> Result<Vec<u8>, LockError>;
}

/// The standard NMDC lock-to-key transform.
#[derive(Debug, Clone, Copy, Default)]
pub struct NmdcKey;

impl KeyDerivation for NmdcKey {
    fn derive_key(&self, lock: &str) -> Result<Vec<u8>, LockError> {
        lock_to_key(lock.as_bytes())
    }
}

/// Compute the key for `lock`: xor neighbouring bytes, swap nibbles, escape reserved bytes.
pub fn lock_to_key(lock: &[u8]) -> Result<Vec<u8>, LockError> {
    let len = lock.len();
    if len < 3 {
        return Err(LockError::TooShort(len));
    }
    let mut key = Vec::with_capacity(len);
    key.push(lock[0] ^ lock[len - 1] ^ lock[len - 2] ^ 5);
    for i in 1..len {
        key.push(lock[i] ^ lock[i - 1]);
    }
    let mut out = Vec::with_capacity(len + 16);
    for b in key {
        let b = b.rotate_left(4);
        if RESERVED.contains(&b) {
            out.extend_from_slice(format!("/%DCN{:03}%/", b).as_bytes());
        } else {
            out.push(b);
        }
    }
    Ok(out)
}

/// A fresh lock for challenging a peer: `EXTENDEDPROTOCOL` followed by random alphanumerics.
pub fn generate_lock() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("{}{}", EXTENDED_PROTOCOL, suffix)
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock too short ({0} bytes, need at least 3)")]
    TooShort(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_for_plain_lock() {
        // 'A'^'C'^'B'^5 = 0x45 -> 0x54; 'B'^'A' = 3 -> 0x30; 'C'^'B' = 1 -> 0x10
        assert_eq!(lock_to_key(b"ABC").unwrap(), vec![0x54, 0x30, 0x10]);
    }

    #[test]
    fn reserved_bytes_escaped() {
        // 'A'^'A' = 0 is reserved.
        assert_eq!(lock_to_key(b"AAB").unwrap(), b"t/%DCN000%/0".to_vec());
    }

    #[test]
    fn short_lock_rejected() {
        assert!(matches!(lock_to_key(b"AB"), Err(LockError::TooShort(2))));
        assert!(NmdcKey.derive_key("").is_err());
    }

    #[test]
    fn random_locks_never_leak_reserved_bytes() {
        for _ in 0..64 {
            let lock = generate_lock();
            assert!(lock.starts_with(EXTENDED_PROTOCOL));
            let key = lock_to_key(lock.as_bytes()).unwrap();
            assert!(!key.iter().any(|b| RESERVED.contains(b)));
        }
    }

    #[test]
    fn random_bytes_never_leak_reserved_bytes() {
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let len = rng.gen_range(3..48);
            let lock: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let key = lock_to_key(&lock).unwrap();
            assert!(key.len() >= len);
            assert!(!key.iter().any(|b| RESERVED.contains(b)));
        }
    }
}
