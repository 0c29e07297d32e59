//! Fixed-pattern XOR stream transform
//!
//! Each byte is XORed with the key byte selected by its absolute file
//! offset, so a buffer can be transformed independently of where the
//! surrounding read or write started. Zero bytes are left untouched, and so
//! is a byte equal to its key byte: that keeps the transform an involution
//! (the output of encrypting a non-zero byte is never zero).

use crate::error::{Error, Result};
use crate::config::MAX_KEY_LEN;

/// XOR obfuscation with a fixed key pattern
#[derive(Clone, PartialEq, Eq)]
pub struct XorCipher {
    key: Vec<u8>,
}

impl std::fmt::Debug for XorCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XorCipher")
            .field("key_len", &self.key.len())
            .finish()
    }
}

impl XorCipher {
    /// Create a cipher from a key pattern of 1..=32 bytes
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(Error::InvalidConfig(format!(
                "Key must be 1..={} bytes, got {}",
                MAX_KEY_LEN,
                key.len()
            )));
        }
        Ok(XorCipher { key })
    }

    /// Create a cipher with a single key byte
    pub fn single(key: u8) -> Self {
        XorCipher { key: vec![key] }
    }

    /// Key byte applied at an absolute file offset
    #[inline]
    fn key_at(&self, pos: u64) -> u8 {
        self.key[(pos % self.key.len() as u64) as usize]
    }

    fn apply(&self, buf: &mut [u8], offset: u64) {
        for (i, byte) in buf.iter_mut().enumerate() {
            let k = self.key_at(offset + i as u64);
            if *byte != 0 && *byte != k {
                *byte ^= k;
            }
        }
    }

    /// Obfuscate `buf` in place; `offset` is the file offset of `buf[0]`
    pub fn encrypt(&self, buf: &mut [u8], offset: u64) {
        self.apply(buf, offset);
    }

    /// Reverse the transform over `buf[..len]` and write a zero terminator
    /// at `buf[len]`.
    ///
    /// The caller must size `buf` to at least `len + 1` bytes; staging
    /// buffers for obfuscated reads are allocated that way.
    pub fn decrypt(&self, buf: &mut [u8], len: usize, offset: u64) {
        debug_assert!(buf.len() > len, "decrypt buffer lacks terminator slot");
        self.apply(&mut buf[..len], offset);
        buf[len] = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, RngCore};

    #[test]
    fn test_scenario_hello_world() {
        let cipher = XorCipher::single(0x5A);
        let mut buf = b"HELLOWORLD".to_vec();
        cipher.encrypt(&mut buf, 0);

        let expected: Vec<u8> = b"HELLOWORLD".iter().map(|b| b ^ 0x5A).collect();
        assert_eq!(buf, expected);

        buf.push(0xFF);
        cipher.decrypt(&mut buf, 10, 0);
        assert_eq!(&buf[..10], b"HELLOWORLD");
        assert_eq!(buf[10], 0);
    }

    #[test]
    fn test_round_trip_every_byte_every_key() {
        let plain: Vec<u8> = (1..=255u8).collect();
        for key in 0..=255u8 {
            let cipher = XorCipher::single(key);
            let mut buf = plain.clone();
            cipher.encrypt(&mut buf, 0);
            buf.push(0);
            cipher.decrypt(&mut buf, plain.len(), 0);
            assert_eq!(&buf[..plain.len()], plain.as_slice(), "key {:#04x}", key);
        }
    }

    #[test]
    fn test_zero_bytes_preserved() {
        let cipher = XorCipher::single(0x5A);
        let mut buf = vec![b'a', 0, b'b', 0, 0, b'c'];
        cipher.encrypt(&mut buf, 0);
        assert_eq!(buf[1], 0);
        assert_eq!(buf[3], 0);
        assert_eq!(buf[4], 0);

        buf.push(0x11);
        cipher.decrypt(&mut buf, 6, 0);
        assert_eq!(&buf[..6], &[b'a', 0, b'b', 0, 0, b'c']);
    }

    #[test]
    fn test_encrypted_output_never_zero() {
        let cipher = XorCipher::single(0x41);
        let mut buf: Vec<u8> = (1..=255u8).collect();
        cipher.encrypt(&mut buf, 0);
        assert!(buf.iter().all(|&b| b != 0));
    }

    #[test]
    fn test_pattern_is_offset_addressed() {
        let cipher = XorCipher::new(vec![0x10, 0x20, 0x30]).unwrap();
        let plain = b"abcdefghij".to_vec();

        let mut whole = plain.clone();
        cipher.encrypt(&mut whole, 7);

        // Encrypting in two pieces at their own offsets gives the same bytes
        let mut head = plain[..4].to_vec();
        let mut tail = plain[4..].to_vec();
        cipher.encrypt(&mut head, 7);
        cipher.encrypt(&mut tail, 11);
        head.extend_from_slice(&tail);
        assert_eq!(head, whole);

        let mut back = whole[3..].to_vec();
        back.push(0);
        cipher.decrypt(&mut back, 7, 10);
        assert_eq!(&back[..7], &plain[3..]);
    }

    #[test]
    fn test_random_round_trip() {
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let key_len = rng.gen_range(1..=MAX_KEY_LEN);
            let mut key = vec![0u8; key_len];
            rng.fill_bytes(&mut key);
            let cipher = XorCipher::new(key).unwrap();

            let len = rng.gen_range(0..512);
            let mut plain = vec![0u8; len];
            rng.fill_bytes(&mut plain);
            let offset = rng.gen_range(0..10_000u64);

            let mut buf = plain.clone();
            cipher.encrypt(&mut buf, offset);
            buf.push(0xEE);
            cipher.decrypt(&mut buf, len, offset);
            assert_eq!(&buf[..len], plain.as_slice());
            assert_eq!(buf[len], 0);
        }
    }

    #[test]
    fn test_rejects_bad_keys() {
        assert!(XorCipher::new(Vec::new()).is_err());
        assert!(XorCipher::new(vec![1u8; MAX_KEY_LEN + 1]).is_err());
        assert!(XorCipher::new(vec![1u8; MAX_KEY_LEN]).is_ok());
    }
}
