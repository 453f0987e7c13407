//! Substitution cipher used by the analytics service to obfuscate series payloads.
//!
//! Every encrypted response comes with an opaque id that resolves to a key. The key
//! is two equal halves: the i-th character of the first half decodes to the i-th
//! character of the second half. Characters outside the mapping pass through.

pub mod cipher;
pub mod error;
pub mod shape;

pub use crate::{
    cipher::{SubstitutionTable, decrypt},
    error::CipherError,
    shape::FieldShape,
};

/// Decrypt and reject output that does not have the expected field layout.
///
/// The plain [`decrypt`] never fails: a truncated or mismatched key produces
/// plausible but wrong text. Callers that know the payload shape should use this.
pub fn decrypt_checked(
    key: &str,
    cipher_text: &str,
    shape: &FieldShape,
) -> Result<String, CipherError> {
    if key.is_empty() {
        return Err(CipherError::EmptyKey);
    }
    if key.chars().count() % 2 != 0 {
        return Err(CipherError::OddKeyLength(key.chars().count()));
    }
    let plain = decrypt(key, cipher_text);
    shape.check(&plain)?;
    Ok(plain)
}
