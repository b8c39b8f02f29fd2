//! One-time passcode generation, hashing and verification.
//!
//! Codes are short decimal strings, so the digest is Argon2id keyed with a
//! server-side pepper: a leaked token alone is not enough to brute force the
//! code offline. Only the PHC-encoded digest leaves this module.

use anyhow::{Context, Result, anyhow, ensure};
use argon2::{
    Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version,
    password_hash::SaltString,
};
use rand::{RngCore, rngs::OsRng};
use secrecy::{ExposeSecret, SecretSlice};

pub const DEFAULT_CODE_LENGTH: usize = 6;
pub const MAX_CODE_LENGTH: usize = 12;

// Largest multiple of 10 that fits in a byte; higher bytes are resampled.
const DIGIT_SAMPLE_LIMIT: u8 = 250;

/// Generate `length` decimal digits from the OS CSPRNG.
///
/// Leading zeros are kept.
///
/// # Errors
/// Returns an error if `length` is outside `1..=MAX_CODE_LENGTH` or the OS RNG fails.
pub fn generate_code(length: usize) -> Result<String> {
    generate_code_with_rng(&mut OsRng, length)
}

fn generate_code_with_rng<R: RngCore + ?Sized>(rng: &mut R, length: usize) -> Result<String> {
    ensure!(
        (1..=MAX_CODE_LENGTH).contains(&length),
        "invalid code length: {length}"
    );

    let mut code = String::with_capacity(length);
    let mut buffer = [0u8; 16];
    while code.len() < length {
        rng.try_fill_bytes(&mut buffer)
            .context("failed to generate one-time code")?;
        for byte in buffer {
            if byte < DIGIT_SAMPLE_LIMIT && code.len() < length {
                code.push(char::from(b'0' + byte % 10));
            }
        }
    }
    Ok(code)
}

/// Shape check for a submitted code: exact length, ASCII digits only.
#[must_use]
pub fn is_well_formed(candidate: &str, length: usize) -> bool {
    candidate.len() == length && candidate.bytes().all(|byte| byte.is_ascii_digit())
}

pub struct OtpCodec {
    pepper: SecretSlice<u8>,
    code_length: usize,
    params: Params,
}

impl std::fmt::Debug for OtpCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtpCodec")
            .field("pepper", &"***")
            .field("code_length", &self.code_length)
            .field("params", &self.params)
            .finish()
    }
}

impl OtpCodec {
    /// Codec with the default Argon2id cost.
    ///
    /// # Errors
    /// Returns an error if the pepper is empty or the length is out of range.
    pub fn new(pepper: SecretSlice<u8>, code_length: usize) -> Result<Self> {
        Self::with_params(pepper, code_length, Params::default())
    }

    /// Codec with explicit Argon2id parameters.
    ///
    /// # Errors
    /// Returns an error if the pepper is empty, the length is out of range, or
    /// Argon2 rejects the pepper.
    pub fn with_params(pepper: SecretSlice<u8>, code_length: usize, params: Params) -> Result<Self> {
        ensure!(!pepper.expose_secret().is_empty(), "OTP pepper must not be empty");
        ensure!(
            (1..=MAX_CODE_LENGTH).contains(&code_length),
            "invalid code length: {code_length}"
        );
        let codec = Self {
            pepper,
            code_length,
            params,
        };
        codec.argon2()?;
        Ok(codec)
    }

    #[must_use]
    pub fn code_length(&self) -> usize {
        self.code_length
    }

    /// Generate a fresh code of the configured length.
    ///
    /// # Errors
    /// Returns an error if the OS RNG fails.
    pub fn generate(&self) -> Result<String> {
        generate_code(self.code_length)
    }

    /// Hash a code into a PHC string with a fresh salt.
    ///
    /// # Errors
    /// Returns an error if the code is malformed or hashing fails.
    pub fn hash(&self, code: &str) -> Result<String> {
        ensure!(
            is_well_formed(code, self.code_length),
            "refusing to hash malformed code"
        );
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()?
            .hash_password(code.as_bytes(), &salt)
            .map_err(|_| anyhow!("failed to hash one-time code"))?
            .to_string();
        Ok(hash)
    }

    /// Check a submitted code against a digest from [`OtpCodec::hash`].
    ///
    /// Never fails: malformed candidates and unparsable digests are `false`.
    #[must_use]
    pub fn verify(&self, candidate: &str, digest: &str) -> bool {
        if !is_well_formed(candidate, self.code_length) {
            return false;
        }
        let Ok(parsed) = PasswordHash::new(digest) else {
            return false;
        };
        let Ok(argon2) = self.argon2() else {
            return false;
        };
        argon2.verify_password(candidate.as_bytes(), &parsed).is_ok()
    }

    fn argon2(&self) -> Result<Argon2<'_>> {
        Argon2::new_with_secret(
            self.pepper.expose_secret(),
            Algorithm::Argon2id,
            Version::V0x13,
            self.params.clone(),
        )
        .map_err(|_| anyhow!("failed to initialize Argon2id"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    pub(crate) fn test_codec() -> OtpCodec {
        let params = Params::new(1024, 1, 1, None).unwrap();
        OtpCodec::with_params(SecretSlice::from(vec![9u8; 32]), 6, params).unwrap()
    }

    #[test]
    fn generate_code_has_requested_length_and_digits() {
        for length in [1, 4, 6, 8, MAX_CODE_LENGTH] {
            let code = generate_code(length).unwrap();
            assert_eq!(code.len(), length);
            assert!(code.bytes().all(|b| b.is_ascii_digit()));
        }
    }

    #[test]
    fn generate_code_rejects_bad_lengths() {
        assert!(generate_code(0).is_err());
        assert!(generate_code(MAX_CODE_LENGTH + 1).is_err());
    }

    #[test]
    fn generated_digits_cover_alphabet() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut counts = [0usize; 10];
        for _ in 0..2_000 {
            let code = generate_code_with_rng(&mut rng, 6).unwrap();
            for byte in code.bytes() {
                counts[usize::from(byte - b'0')] += 1;
            }
        }
        // 12_000 digits, expected 1_200 each; bounds are very loose.
        for count in counts {
            assert!((900..1_500).contains(&count), "skewed digit count: {count}");
        }
    }

    #[test]
    fn is_well_formed_checks_length_and_digits() {
        assert!(is_well_formed("012345", 6));
        assert!(!is_well_formed("12345", 6));
        assert!(!is_well_formed("1234567", 6));
        assert!(!is_well_formed("12a456", 6));
        assert!(!is_well_formed("١٢٣٤٥٦", 6));
        assert!(!is_well_formed("", 6));
    }

    #[test]
    fn verify_accepts_only_the_hashed_code() {
        let codec = test_codec();
        let digest = codec.hash("123456").unwrap();
        assert!(codec.verify("123456", &digest));
        for other in ["123457", "000000", "654321", "023456"] {
            assert!(!codec.verify(other, &digest));
        }
    }

    #[test]
    fn verify_round_trips_generated_codes() {
        let codec = test_codec();
        for _ in 0..3 {
            let code = codec.generate().unwrap();
            let digest = codec.hash(&code).unwrap();
            assert!(codec.verify(&code, &digest));
        }
    }

    #[test]
    fn verify_rejects_malformed_candidates() {
        let codec = test_codec();
        let digest = codec.hash("123456").unwrap();
        for candidate in ["", "12345", "1234567", "12345a", " 123456", "123456\n"] {
            assert!(!codec.verify(candidate, &digest));
        }
    }

    #[test]
    fn verify_rejects_garbage_digest() {
        let codec = test_codec();
        assert!(!codec.verify("123456", "not-a-phc-string"));
        assert!(!codec.verify("123456", ""));
    }

    #[test]
    fn hash_is_salted_and_not_the_code() {
        let codec = test_codec();
        let first = codec.hash("123456").unwrap();
        let second = codec.hash("123456").unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with("$argon2id$"));
        assert!(!first.contains("123456"));
    }

    #[test]
    fn hash_rejects_malformed_code() {
        let codec = test_codec();
        assert!(codec.hash("12").is_err());
        assert!(codec.hash("abcdef").is_err());
    }

    #[test]
    fn digest_is_bound_to_pepper() {
        let codec = test_codec();
        let digest = codec.hash("123456").unwrap();
        let params = Params::new(1024, 1, 1, None).unwrap();
        let other =
            OtpCodec::with_params(SecretSlice::from(vec![1u8; 32]), 6, params).unwrap();
        assert!(!other.verify("123456", &digest));
    }

    #[test]
    fn codec_rejects_empty_pepper() {
        assert!(OtpCodec::new(SecretSlice::from(Vec::new()), 6).is_err());
    }

    #[test]
    fn debug_redacts_pepper() {
        let codec = test_codec();
        let debug = format!("{codec:?}");
        assert!(debug.contains("***"));
    }
}
