//! Niche input validation.

pub const MIN_NICHE_CHARS: usize = 5;
pub const MAX_NICHE_CHARS: usize = 200;

/// Characters that could break out of prompt templates.
pub const DISALLOWED_CHARS: [char; 10] = ['<', '>', '{', '}', '[', ']', '|', '\\', '^', '~'];

/// Check a niche before anything is spent on it. Lengths count characters.
pub fn validate_niche(niche: &str) -> Result<(), String> {
    if niche.is_empty() {
        return Err("Niche is empty".to_string());
    }

    let len = niche.chars().count();
    if len < MIN_NICHE_CHARS {
        return Err(format!(
            "Niche too short (min {} chars): '{}'",
            MIN_NICHE_CHARS, niche
        ));
    }
    if len > MAX_NICHE_CHARS {
        return Err(format!(
            "Niche too long (max {} chars): {} chars",
            MAX_NICHE_CHARS, len
        ));
    }

    if let Some(c) = niche.chars().find(|c| DISALLOWED_CHARS.contains(c)) {
        return Err(format!("Niche contains suspicious character: '{}'", c));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_boundaries() {
        assert!(validate_niche(&"a".repeat(4)).is_err());
        assert!(validate_niche(&"a".repeat(5)).is_ok());
        assert!(validate_niche(&"a".repeat(200)).is_ok());
        assert!(validate_niche(&"a".repeat(201)).is_err());
    }

    #[test]
    fn messages() {
        assert_eq!(validate_niche("").unwrap_err(), "Niche is empty");
        assert!(validate_niche("abc").unwrap_err().starts_with("Niche too short"));
        assert!(validate_niche(&"a".repeat(300)).unwrap_err().contains("300 chars"));
    }

    #[test]
    fn disallowed_characters() {
        assert!(validate_niche("Rust <script> audio")
            .unwrap_err()
            .contains("'<'"));
        for c in DISALLOWED_CHARS {
            assert!(validate_niche(&format!("valid niche {c}")).is_err(), "{c}");
        }
        assert!(validate_niche("Rust WASM for real-time audio").is_ok());
    }

    #[test]
    fn counts_characters_not_bytes() {
        // five two-byte characters
        assert!(validate_niche("ééééé").is_ok());
        assert!(validate_niche(&"é".repeat(200)).is_ok());
    }
}
