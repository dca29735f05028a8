//! Small shared helpers.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use subtle::ConstantTimeEq;

/// Generate a URL-safe random token from `n_bytes` of entropy.
///
/// 32 bytes yields a 43-character token (256 bits).
#[must_use]
pub fn urlsafe_token(n_bytes: usize) -> String {
    let mut bytes = vec![0u8; n_bytes];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a lowercase hex token from `n_bytes` of entropy.
#[must_use]
pub fn hex_token(n_bytes: usize) -> String {
    let mut bytes = vec![0u8; n_bytes];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Constant-time string equality for token comparison.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_length_and_uniqueness() {
        let token = urlsafe_token(32);
        assert!(token.len() >= 43);
        assert!(
            token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
        assert_ne!(urlsafe_token(32), urlsafe_token(32));
    }

    #[test]
    fn hex_token_shape() {
        let token = hex_token(4);
        assert_eq!(token.len(), 8);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn comparison_semantics() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secre_"));
        assert!(!constant_time_eq("secret", "longer-secret"));
        assert!(constant_time_eq("", ""));
    }
}
