/// Canonical form of a query used as the cache key and the store lookup key.
///
/// Trims, collapses internal whitespace runs to a single space, and lowercases.
/// Returns an empty string for whitespace-only input.
pub fn normalize_query(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_trims_and_lowercases() {
        assert_eq!(normalize_query("  What is 2+2? "), "what is 2+2?");
    }

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(normalize_query("what\tis \n 2+2?"), "what is 2+2?");
    }

    #[test]
    fn test_normalize_whitespace_only_is_empty() {
        assert_eq!(normalize_query(" \t\n "), "");
    }

    #[test]
    fn test_equivalent_queries_share_a_key() {
        assert_eq!(
            normalize_query("Explain   Rust lifetimes"),
            normalize_query("explain rust LIFETIMES")
        );
    }
}
