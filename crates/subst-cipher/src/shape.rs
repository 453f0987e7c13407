use crate::error::CipherError;

/// Expected layout of a decrypted payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldShape {
    pub delimiter: char,
    pub expected_fields: usize,
    /// Characters allowed inside a field. `None` accepts anything.
    pub alphabet: Option<&'static str>,
}

impl FieldShape {
    pub fn new(delimiter: char, expected_fields: usize) -> Self {
        Self {
            delimiter,
            expected_fields,
            alphabet: None,
        }
    }

    /// Comma separated integers, empty fields allowed (missing days).
    pub fn numeric_csv(expected_fields: usize) -> Self {
        Self {
            delimiter: ',',
            expected_fields,
            alphabet: Some("0123456789-"),
        }
    }

    pub fn check(&self, plain: &str) -> Result<(), CipherError> {
        let actual = plain.split(self.delimiter).count();
        if actual != self.expected_fields {
            return Err(CipherError::ShapeMismatch {
                expected: self.expected_fields,
                actual,
            });
        }
        if let Some(alphabet) = self.alphabet
            && let Some(bad) = plain
                .chars()
                .find(|c| *c != self.delimiter && !alphabet.contains(*c))
        {
            return Err(CipherError::UnexpectedChar(bad));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decrypt_checked;

    #[test]
    fn test_shape_accepts_matching_payload() {
        let shape = FieldShape::numeric_csv(3);
        assert!(shape.check("1,,3").is_ok());
    }

    #[test]
    fn test_shape_rejects_wrong_field_count() {
        let shape = FieldShape::numeric_csv(3);
        assert_eq!(
            shape.check("1,2"),
            Err(CipherError::ShapeMismatch {
                expected: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn test_checked_decrypt_catches_garbled_output() {
        // key only covers two of the cipher characters
        let err = decrypt_checked("abXY", "ab,c", &FieldShape::numeric_csv(2)).unwrap_err();
        assert_eq!(err, CipherError::UnexpectedChar('X'));

        let key = "ab-12,";
        assert_eq!(
            decrypt_checked(key, "ab-a", &FieldShape::numeric_csv(2)).unwrap(),
            "12,1"
        );
    }

    #[test]
    fn test_checked_decrypt_rejects_bad_keys() {
        let shape = FieldShape::new(',', 1);
        assert_eq!(decrypt_checked("", "x", &shape), Err(CipherError::EmptyKey));
        assert_eq!(
            decrypt_checked("abc", "x", &shape),
            Err(CipherError::OddKeyLength(3))
        );
    }
}
