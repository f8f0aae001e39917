//! Key Pattern Matching
//!
//! Glob-style key filters where `*` is the only wildcard.

/// Returns true when `key` matches `pattern`.
///
/// A pattern without `*` matches only the identical key. Otherwise the
/// non-empty segments between wildcards must occur in `key` in order and
/// without overlapping; the match is not anchored at either end, so `"a*c"`
/// accepts `"abc"` and `"xaXcx"` but not `"cab"`.
pub fn matches_pattern(key: &str, pattern: &str) -> bool {
    if !pattern.contains('*') {
        return key == pattern;
    }

    let mut rest = key;
    for segment in pattern.split('*').filter(|s| !s.is_empty()) {
        match rest.find(segment) {
            Some(at) => rest = &rest[at + segment.len()..],
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_pattern() {
        assert!(matches_pattern("hello", "hello"));
        assert!(!matches_pattern("hello!", "hello"));
        assert!(!matches_pattern("", "hello"));
    }

    #[test]
    fn test_wildcard_segments_in_order() {
        assert!(matches_pattern("abc", "a*c"));
        assert!(matches_pattern("aXc", "a*c"));
        assert!(matches_pattern("ac", "a*c"));
        assert!(matches_pattern("xxaYYcxx", "a*c"));
        assert!(!matches_pattern("cab", "a*c"));
    }

    #[test]
    fn test_lone_wildcards_match_everything() {
        assert!(matches_pattern("", "*"));
        assert!(matches_pattern("anything", "**"));
    }

    #[test]
    fn test_segments_do_not_overlap() {
        assert!(!matches_pattern("aba", "aba*ba"));
        assert!(matches_pattern("ababa", "aba*ba"));
    }

    #[test]
    fn test_multibyte_keys() {
        assert!(matches_pattern("привет мир", "при*мир"));
        assert!(!matches_pattern("мир привет", "при*мир"));
    }
}
