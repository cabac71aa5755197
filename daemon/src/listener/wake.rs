//! Wake phrase matching
//!
//! Plain case-insensitive substring matching. The list includes the
//! recognizer's usual misspellings of the assistant's name.

/// Phrases that wake the assistant from passive listening
pub const WAKE_PHRASES: &[&str] = &["oye nova", "hey nova", "oi nova", "oye nu va", "hey nu va"];

/// Check if a recognizer hypothesis contains any wake phrase
pub fn contains_wake_phrase(text: &str) -> bool {
    let lower = text.to_lowercase();
    WAKE_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

/// Lower-case the utterance and remove every wake phrase from it
pub fn strip_wake_phrases(text: &str) -> String {
    let mut clean = text.to_lowercase();
    for phrase in WAKE_PHRASES {
        clean = clean.replace(phrase, "");
    }
    clean.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_phrases_case_insensitive() {
        assert!(contains_wake_phrase("Hey Nova"));
        assert!(contains_wake_phrase("uh OYE NOVA qué hora es"));
        assert!(contains_wake_phrase("hey nu va"));
        assert!(!contains_wake_phrase("hey there"));
        assert!(!contains_wake_phrase(""));
    }

    #[test]
    fn test_strip_leaves_request() {
        assert_eq!(strip_wake_phrases("hey nova what is this"), "what is this");
        assert_eq!(strip_wake_phrases("Oye Nova  ¿Qué ves?"), "¿qué ves?");
        assert_eq!(strip_wake_phrases("what is this"), "what is this");
    }

    #[test]
    fn test_strip_only_wake_phrase_is_blank() {
        assert!(strip_wake_phrases("Hey Nova").is_empty());
        assert!(strip_wake_phrases("   ").is_empty());
    }
}
