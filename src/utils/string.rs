//! String helpers for log output

/// Truncate to at most `max_chars` characters on a char boundary
pub fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Masked form of a credential for logs: first four and last four
/// characters, e.g. `hf_a…wxyz`. Short values are masked entirely.
pub fn mask_secret(secret: &str) -> String {
    let count = secret.chars().count();
    if count <= 12 {
        return "*".repeat(count.min(8));
    }

    let head = truncate_str(secret, 4);
    let tail: String = secret.chars().skip(count - 4).collect();
    format!("{}…{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("upstream said no", 8), "upstream");
        assert_eq!(truncate_str("short", 100), "short");
        assert_eq!(truncate_str("", 10), "");
    }

    #[test]
    fn test_truncate_str_multibyte() {
        let text = "clé→valeur";
        assert_eq!(truncate_str(text, 3), "clé");
        assert_eq!(truncate_str(text, 4), "clé→");
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("hf_abcdefghijklmnopwxyz"), "hf_a…wxyz");
        assert_eq!(mask_secret("hf_short"), "********");
        assert_eq!(mask_secret("abc"), "***");
        assert_eq!(mask_secret(""), "");
    }
}
