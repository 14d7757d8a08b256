//! Secret token material.

use rand::rngs::OsRng;
use rand::RngCore;

/// Size in bytes of runner and per-execution lease tokens.
pub const RUNNER_TOKEN_BYTES: usize = 32;

/// Returns `n` bytes of OS randomness, hex-encoded.
pub fn random_token(n: usize) -> String {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_hex_of_requested_size() {
        let token = random_token(RUNNER_TOKEN_BYTES);
        assert_eq!(token.len(), RUNNER_TOKEN_BYTES * 2);
        assert!(token.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn tokens_differ() {
        assert_ne!(random_token(32), random_token(32));
    }
}
