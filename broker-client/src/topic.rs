//! Routing-key matching for exchange bindings.
//!
//! Topic routing keys are dot-separated words. A binding pattern may use two
//! wildcards:
//! - `*` matches exactly one word: `orders.*` matches `orders.created`
//! - `#` matches zero or more words: `orders.#` matches `orders` and `orders.us.created`

use crate::types::ExchangeType;

/// Separator between routing-key words
pub const WORD_SEPARATOR: char = '.';
/// Wildcard matching exactly one word
pub const WILDCARD_SINGLE: &str = "*";
/// Wildcard matching zero or more words
pub const WILDCARD_MULTI: &str = "#";

/// Check whether a topic binding pattern matches a routing key.
///
/// Runs in `O(pattern words × key words)` regardless of how many `#`
/// wildcards the pattern holds.
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    match_words(&words(pattern), &words(routing_key))
}

/// Check whether a binding on an exchange of the given type accepts a routing key.
pub fn binding_accepts(kind: ExchangeType, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeType::Direct => binding_key == routing_key,
        ExchangeType::Fanout => true,
        ExchangeType::Topic => matches(binding_key, routing_key),
        // Headers exchanges never route on the key; the memory broker refuses to declare them.
        ExchangeType::Headers => false,
    }
}

/// Whether the pattern contains any wildcard word.
pub fn is_pattern(pattern: &str) -> bool {
    words(pattern)
        .iter()
        .any(|w| *w == WILDCARD_SINGLE || *w == WILDCARD_MULTI)
}

fn words(key: &str) -> Vec<&str> {
    if key.is_empty() {
        Vec::new()
    } else {
        key.split(WORD_SEPARATOR).collect()
    }
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    // reached[k]: the pattern words seen so far can consume exactly key[..k]
    let mut reached = vec![false; key.len() + 1];
    reached[0] = true;

    for &word in pattern {
        let mut next = vec![false; key.len() + 1];
        match word {
            WILDCARD_MULTI => {
                let mut any = false;
                for (k, slot) in next.iter_mut().enumerate() {
                    any |= reached[k];
                    *slot = any;
                }
            }
            WILDCARD_SINGLE => {
                for k in 0..key.len() {
                    next[k + 1] = reached[k];
                }
            }
            literal => {
                for k in 0..key.len() {
                    next[k + 1] = reached[k] && key[k] == literal;
                }
            }
        }
        if !next.contains(&true) {
            return false;
        }
        reached = next;
    }

    reached[key.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("broker-test.on", "broker-test.on", true)]
    #[case("broker-test.#", "broker-test.on", true)]
    #[case("broker-test.#", "broker-test", true)]
    #[case("broker-test.#", "broker-test.a.b.c", true)]
    #[case("broker-test.*", "broker-test.on", true)]
    #[case("broker-test.*", "broker-test", false)]
    #[case("broker-test.*", "broker-test.a.b", false)]
    #[case("*.on", "broker-test.on", true)]
    #[case("#.on", "on", true)]
    #[case("#.on", "a.b.on", true)]
    #[case("#.on", "a.b.off", false)]
    #[case("a.#.z", "a.z", true)]
    #[case("a.#.z", "a.b.c.z", true)]
    #[case("a.#.#.z", "a.b.z", true)]
    #[case("#", "", true)]
    #[case("*", "", false)]
    #[case("x", "y", false)]
    fn test_topic_matches(#[case] pattern: &str, #[case] key: &str, #[case] expected: bool) {
        assert_eq!(matches(pattern, key), expected, "{} vs {}", pattern, key);
    }

    #[test]
    fn test_binding_accepts_by_exchange_type() {
        assert!(binding_accepts(ExchangeType::Direct, "a.b", "a.b"));
        assert!(!binding_accepts(ExchangeType::Direct, "a.*", "a.b"));
        assert!(binding_accepts(ExchangeType::Fanout, "ignored", "anything"));
        assert!(binding_accepts(ExchangeType::Topic, "a.*", "a.b"));
        assert!(!binding_accepts(ExchangeType::Headers, "a.b", "a.b"));
    }

    #[test]
    fn test_many_multi_wildcards_stay_fast() {
        let pattern = vec!["#.a"; 12].join(".") + ".#.b";
        let key = vec!["a"; 200].join(".");

        let started = std::time::Instant::now();
        assert!(!matches(&pattern, &key));
        assert!(matches(&pattern, &format!("{}.b", key)));
        assert!(
            started.elapsed() < std::time::Duration::from_millis(500),
            "matching took {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn test_is_pattern() {
        assert!(is_pattern("a.#"));
        assert!(is_pattern("*.b"));
        assert!(!is_pattern("a.b"));
        assert!(!is_pattern("a#.b"));
    }

    fn word() -> impl Strategy<Value = String> {
        "[a-z0-9-]{1,8}"
    }

    fn key() -> impl Strategy<Value = String> {
        prop::collection::vec(word(), 1..6).prop_map(|w| w.join("."))
    }

    proptest! {
        #[test]
        fn prop_literal_pattern_matches_itself(k in key()) {
            prop_assert!(matches(&k, &k));
        }

        #[test]
        fn prop_multi_wildcard_matches_everything(k in key()) {
            prop_assert!(matches("#", &k));
        }

        #[test]
        fn prop_single_wildcard_matches_one_word(k in key()) {
            let word_count = k.split('.').count();
            prop_assert_eq!(matches("*", &k), word_count == 1);
        }

        #[test]
        fn prop_wildcard_in_place_of_word(k in key(), index in 0usize..6) {
            let mut pattern: Vec<&str> = k.split('.').collect();
            let index = index % pattern.len();
            pattern[index] = WILDCARD_SINGLE;
            prop_assert!(matches(&pattern.join("."), &k));
            pattern[index] = WILDCARD_MULTI;
            prop_assert!(matches(&pattern.join("."), &k));
        }

        #[test]
        fn prop_prefix_multi_wildcard(prefix in word(), k in key()) {
            let pattern = format!("{}.#", prefix);
            let routed = format!("{}.{}", prefix, k);
            prop_assert!(matches(&pattern, &routed));
            prop_assert!(matches(&pattern, &prefix));
        }
    }
}
