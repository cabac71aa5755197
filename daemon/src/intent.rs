//! Decides whether a request needs the current camera frame
//!
//! A plain keyword heuristic: visual, demonstrative and descriptive terms in
//! either supported language. Extend the tables to add languages.

const SPANISH_KEYWORDS: &[&str] = &[
    "veo", "ves", "viendo", "miro", "mirando", "esto", "eso", "lee", "leer", "cartel",
    "describe", "qué hay", "qué es", "frente", "muestra", "foto", "imagen", "texto",
    "letrero", "pantalla", "objeto", "color", "persona", "escena",
];

const ENGLISH_KEYWORDS: &[&str] = &[
    "see", "seeing", "look", "looking", "this", "that", "read", "sign", "describe",
    "what is", "what's", "show", "photo", "image", "text", "screen", "object", "color",
    "person", "scene", "front",
];

/// Returns true if the transcript mentions anything visual
pub fn needs_image(transcript: &str) -> bool {
    let lower = transcript.to_lowercase();
    SPANISH_KEYWORDS
        .iter()
        .chain(ENGLISH_KEYWORDS)
        .any(|keyword| lower.contains(keyword))
}
