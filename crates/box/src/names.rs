//! Reserved character mapping for Box item names
//!
//! Box refuses names containing a backslash, so it is stored as the
//! FULLWIDTH REVERSE SOLIDUS lookalike and mapped back when read.

const BACKSLASH: &str = "\\";
const FULLWIDTH_REVERSE_SOLIDUS: &str = "\u{FF3C}";

/// Substitute characters Box can't store
pub fn replace_reserved(name: &str) -> String {
    name.replace(BACKSLASH, FULLWIDTH_REVERSE_SOLIDUS)
}

/// Undo [`replace_reserved`] on a name read from Box
pub fn restore_reserved(name: &str) -> String {
    name.replace(FULLWIDTH_REVERSE_SOLIDUS, BACKSLASH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace() {
        assert_eq!(replace_reserved(r"a\b"), "a\u{FF3C}b");
        assert_eq!(replace_reserved("plain"), "plain");
        assert_eq!(restore_reserved("a\u{FF3C}b"), r"a\b");
    }

    #[test]
    fn test_round_trip() {
        for name in [r"\", r"\\leading", r"trailing\", r"mid\dle\name", "ünï\\cødé", ""] {
            assert_eq!(restore_reserved(&replace_reserved(name)), name);
        }
    }
}
