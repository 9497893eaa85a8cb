//! Identifier generation and validation.
//!
//! IDs are opaque strings of the form `{kind}_{epochMillis}_{9-char-base36}`,
//! e.g. `task_1732550400123_3f8a1c9b2`. The millisecond timestamp keeps
//! ids roughly sortable by creation order; the random suffix makes
//! collisions within the same millisecond practically impossible.

use rand::Rng;

const SUFFIX_LEN: usize = 9;
const BASE36_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generates a new id with the given kind prefix (`task`, `agent`, `msg`,
/// `session`, ...).
pub fn generate(kind: &str, now_millis: i64) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| BASE36_ALPHABET[rng.gen_range(0..BASE36_ALPHABET.len())] as char)
        .collect();
    format!("{kind}_{now_millis}_{suffix}")
}

/// Validates the external identifier syntax required by consumers of the
/// core (spec.md §6): letters, digits, underscore, and hyphen only.
pub fn is_valid(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_prefixed_ids() {
        let id = generate("task", 1_732_550_400_123);
        assert!(id.starts_with("task_1732550400123_"));
        assert_eq!(id.split('_').nth(2).unwrap().len(), SUFFIX_LEN);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = generate("agent", 1_732_550_400_123);
        let b = generate("agent", 1_732_550_400_123);
        assert_ne!(a, b);
    }

    #[test]
    fn validates_syntax() {
        assert!(is_valid("task_123_abc123xyz"));
        assert!(!is_valid("task 123"));
        assert!(!is_valid(""));
        assert!(!is_valid("task/123"));
    }
}
