//! Generator for locally minted advisory identifiers.

use rand::Rng;

/// Prefix shared by every generated identifier.
pub const ADVISORY_ID_PREFIX: &str = "PKSA";

/// Characters used in generated ids.
///
/// No vowels, so ids never spell words, and none of the look-alikes
/// `I`, `O`, `l` and `0`.
pub const ALPHABET: &[u8] = b"bcdfghjkmnpqrstvwxyz123456789";

const GROUPS: usize = 3;
const GROUP_LEN: usize = 4;

/// Generates ids of the shape `PKSA-xxxx-xxxx-xxxx`.
///
/// Uniqueness is not checked here. Callers retry with a fresh id when the
/// store rejects one.
#[derive(Debug, Clone, Default)]
pub struct AdvisoryIdGenerator;

impl AdvisoryIdGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Generate a new identifier.
    pub fn generate(&self) -> String {
        let mut rng = rand::rng();
        let mut id = String::with_capacity(ADVISORY_ID_PREFIX.len() + GROUPS * (GROUP_LEN + 1));
        id.push_str(ADVISORY_ID_PREFIX);

        for _ in 0..GROUPS {
            id.push('-');
            for _ in 0..GROUP_LEN {
                let idx = rng.random_range(0..ALPHABET.len());
                id.push(ALPHABET[idx] as char);
            }
        }

        id
    }

    /// Whether `candidate` has the shape of a generated id.
    pub fn is_generated_id(candidate: &str) -> bool {
        let Some(rest) = candidate
            .strip_prefix(ADVISORY_ID_PREFIX)
            .and_then(|r| r.strip_prefix('-'))
        else {
            return false;
        };

        let groups: Vec<&str> = rest.split('-').collect();
        groups.len() == GROUPS
            && groups.iter().all(|g| {
                g.len() == GROUP_LEN && g.bytes().all(|b| ALPHABET.contains(&b))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_id_shape() {
        let generator = AdvisoryIdGenerator::new();
        for _ in 0..100 {
            let id = generator.generate();
            assert_eq!(id.len(), 19, "unexpected length for {id}");
            assert!(id.starts_with("PKSA-"));
            assert!(AdvisoryIdGenerator::is_generated_id(&id), "{id}");
        }
    }

    #[test]
    fn test_alphabet_excludes_ambiguous_characters() {
        for forbidden in b"aeiouAEIOUIOl0" {
            assert!(!ALPHABET.contains(forbidden), "{}", *forbidden as char);
        }
        let unique: HashSet<_> = ALPHABET.iter().collect();
        assert_eq!(unique.len(), ALPHABET.len());
    }

    #[test]
    fn test_generated_ids_differ() {
        let generator = AdvisoryIdGenerator::new();
        let ids: HashSet<String> = (0..50).map(|_| generator.generate()).collect();
        assert!(ids.len() > 45);
    }

    #[test]
    fn test_is_generated_id_rejects_other_shapes() {
        assert!(!AdvisoryIdGenerator::is_generated_id("GHSA-xxxx-yyyy-zzzz"));
        assert!(!AdvisoryIdGenerator::is_generated_id("PKSA-abcd-bcdf-ghjk"));
        assert!(!AdvisoryIdGenerator::is_generated_id("PKSA-bcdf-ghjk"));
    }
}
