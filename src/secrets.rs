// src/secrets.rs

//! Random credential generation
//!
//! Characters are drawn by rejection sampling over a raw byte stream: a byte
//! is used only if it falls below the largest multiple of the alphabet size
//! that fits in a byte, so `byte % len` is exactly uniform over the
//! alphabet. Bytes at or above that bound are discarded.

use rand::RngCore;
use rand::rngs::OsRng;

/// Alphabet for database passwords (safe in SQL literals and DSN URLs)
pub const PASSWORD_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Alphabet for the webmail session encryption key
pub const DES_KEY_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*()-_+=";

pub const PASSWORD_LEN: usize = 32;
/// Roundcube requires exactly 24 characters
pub const DES_KEY_LEN: usize = 24;

/// Sample `len` characters uniformly from `charset`
///
/// `charset` must be non-empty and at most 256 entries long.
pub fn sample<R: RngCore + ?Sized>(rng: &mut R, charset: &[u8], len: usize) -> String {
    assert!(
        !charset.is_empty() && charset.len() <= 256,
        "charset must have 1..=256 entries"
    );
    let n = charset.len();
    let bound = 256 - (256 % n);

    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 64];
    while out.len() < len {
        rng.fill_bytes(&mut buf);
        for &byte in &buf {
            let b = byte as usize;
            if b >= bound {
                continue;
            }
            out.push(charset[b % n] as char);
            if out.len() == len {
                break;
            }
        }
    }
    out
}

/// Database password from the OS CSPRNG
pub fn generate_password() -> String {
    sample(&mut OsRng, PASSWORD_CHARSET, PASSWORD_LEN)
}

/// Session encryption key from the OS CSPRNG
pub fn generate_des_key() -> String {
    sample(&mut OsRng, DES_KEY_CHARSET, DES_KEY_LEN)
}

/// Credentials generated for one webmail installation
///
/// `Debug` is implemented by hand so secrets never reach a log line.
#[derive(Clone)]
pub struct WebmailSecrets {
    pub db_password: String,
    pub des_key: String,
}

impl WebmailSecrets {
    pub fn generate() -> Self {
        Self {
            db_password: generate_password(),
            des_key: generate_des_key(),
        }
    }
}

impl std::fmt::Debug for WebmailSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebmailSecrets")
            .field("db_password", &"<redacted>")
            .field("des_key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashMap;

    /// Chi-squared statistic of observed character counts against a uniform expectation
    fn chi_squared(sample: &str, charset: &[u8]) -> f64 {
        let mut counts: HashMap<u8, u64> = charset.iter().map(|&c| (c, 0)).collect();
        for b in sample.bytes() {
            *counts.get_mut(&b).expect("character outside charset") += 1;
        }
        let expected = sample.len() as f64 / charset.len() as f64;
        counts
            .values()
            .map(|&observed| {
                let diff = observed as f64 - expected;
                diff * diff / expected
            })
            .sum()
    }

    #[test]
    fn test_lengths_and_alphabet() {
        let password = generate_password();
        assert_eq!(password.len(), PASSWORD_LEN);
        assert!(password.bytes().all(|b| PASSWORD_CHARSET.contains(&b)));

        let key = generate_des_key();
        assert_eq!(key.len(), DES_KEY_LEN);
        assert!(key.bytes().all(|b| DES_KEY_CHARSET.contains(&b)));
    }

    #[test]
    fn test_password_distribution_is_uniform() {
        // 62 symbols -> 61 degrees of freedom; p = 1e-5 critical value is ~116
        let mut rng = StdRng::seed_from_u64(0x6d61_696c);
        let sample = sample(&mut rng, PASSWORD_CHARSET, 310_000);
        let stat = chi_squared(&sample, PASSWORD_CHARSET);
        assert!(stat < 116.0, "chi-squared {} indicates skew", stat);
    }

    #[test]
    fn test_des_key_distribution_is_uniform() {
        // 75 symbols -> 74 degrees of freedom; p = 1e-5 critical value is ~133
        let mut rng = StdRng::seed_from_u64(42);
        let sample = sample(&mut rng, DES_KEY_CHARSET, 300_000);
        let stat = chi_squared(&sample, DES_KEY_CHARSET);
        assert!(stat < 133.0, "chi-squared {} indicates skew", stat);
    }

    #[test]
    fn test_modulo_without_rejection_would_skew() {
        // Sanity check that the statistic detects bias: feed every byte value
        // equally often through a naive `% len` mapping.
        let naive: String = (0..=255u8)
            .cycle()
            .take(256 * 1000)
            .map(|b| PASSWORD_CHARSET[b as usize % PASSWORD_CHARSET.len()] as char)
            .collect();
        assert!(chi_squared(&naive, PASSWORD_CHARSET) > 116.0);
    }

    #[test]
    fn test_secrets_debug_is_redacted() {
        let secrets = WebmailSecrets::generate();
        let debug = format!("{:?}", secrets);
        assert!(!debug.contains(&secrets.db_password));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn test_generated_passwords_differ() {
        assert_ne!(generate_password(), generate_password());
    }
}
