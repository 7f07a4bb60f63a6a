/// Character-class token estimate.
///
/// ASCII text averages about four characters per token; CJK and other
/// non-ASCII scripts about one and a half. Never returns zero.
pub fn estimate_tokens(text: &str) -> usize {
    let (ascii, other) = text.chars().fold((0usize, 0usize), |(a, o), c| {
        if c.is_ascii() {
            (a + 1, o)
        } else {
            (a, o + 1)
        }
    });

    let tokens = ascii.div_ceil(4) + (other as f64 / 1.5).ceil() as usize;
    tokens.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_estimate() {
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn test_non_ascii_estimate() {
        assert_eq!(estimate_tokens("日本語"), 2);
    }

    #[test]
    fn test_empty_is_one() {
        assert_eq!(estimate_tokens(""), 1);
    }
}
