use rustc_hash::FxHashMap;

/// Character mapping built from one decryption key.
///
/// Building the table once is worthwhile when the same key decodes several
/// series (the service returns one key per response group).
#[derive(Debug, Clone, Default)]
pub struct SubstitutionTable {
    map: FxHashMap<char, char>,
}

impl SubstitutionTable {
    /// Build the table from a key. An odd trailing character is ignored.
    pub fn from_key(key: &str) -> Self {
        let chars: Vec<char> = key.chars().collect();
        let half = chars.len() / 2;
        let mut map = FxHashMap::with_capacity_and_hasher(half, Default::default());
        for (from, to) in chars[..half].iter().zip(&chars[half..half * 2]) {
            map.insert(*from, *to);
        }
        Self { map }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Map a single character, passing unknown ones through.
    #[inline]
    pub fn map_char(&self, c: char) -> char {
        self.map.get(&c).copied().unwrap_or(c)
    }

    pub fn decode(&self, cipher_text: &str) -> String {
        cipher_text.chars().map(|c| self.map_char(c)).collect()
    }
}

/// Decode `cipher_text` with `key`.
///
/// Returns an empty string when either input is empty.
pub fn decrypt(key: &str, cipher_text: &str) -> String {
    if key.is_empty() || cipher_text.is_empty() {
        return String::new();
    }
    SubstitutionTable::from_key(key).decode(cipher_text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decrypt_maps_first_half_to_second_half() {
        assert_eq!(decrypt("abXY", "ab"), "XY");
        assert_eq!(decrypt("abXY", "ba"), "YX");
    }

    #[test]
    fn test_decrypt_passes_unmapped_through() {
        assert_eq!(decrypt("abXY", "a-c"), "X-c");
    }

    #[test]
    fn test_decrypt_empty_inputs() {
        assert_eq!(decrypt("", "anything"), "");
        assert_eq!(decrypt("abXY", ""), "");
    }

    #[test]
    fn test_decrypt_realistic_key() {
        // digits and the delimiter are scrambled into letters
        let key = "qwertyuiop,0123456789,";
        let table = SubstitutionTable::from_key(key);
        assert_eq!(table.len(), 11);
        assert_eq!(decrypt(key, "qwe,rty"), "012,345");
    }

    #[test]
    fn test_odd_key_ignores_trailing_char() {
        let table = SubstitutionTable::from_key("abXYz");
        assert_eq!(table.len(), 2);
        assert_eq!(table.decode("abz"), "XYz");
    }

    #[test]
    fn test_multibyte_characters() {
        assert_eq!(decrypt("甲乙12", "乙甲"), "21");
    }
}
