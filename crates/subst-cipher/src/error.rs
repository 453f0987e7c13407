use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("decryption key is empty")]
    EmptyKey,

    #[error("decryption key has odd length {0}")]
    OddKeyLength(usize),

    #[error("decrypted payload has {actual} fields, expected {expected}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("decrypted payload contains unexpected character {0:?}")]
    UnexpectedChar(char),
}
