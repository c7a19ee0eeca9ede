//! Deterministic cache keys for synthesis requests
//!
//! Two requests that would produce the same audio must hash identically, so
//! the text is NFC-normalized and stripped of surrounding ASCII whitespace
//! before hashing. The key stays process-local and is never sent anywhere.

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Field delimiter; cannot occur in model names, voices, or sensible text,
/// so `("ab","c")` and `("a","bc")` cannot collide.
const SEP: u8 = 0x1f;

/// Compute the cache fingerprint for a `(model, voice, text)` triple.
///
/// Returns lowercase hex, stable across restarts and architectures.
pub fn fingerprint(model: &str, voice: &str, text: &str) -> String {
    let normalized: String = text
        .trim_matches(|c: char| c.is_ascii_whitespace())
        .nfc()
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([SEP]);
    hasher.update(voice.as_bytes());
    hasher.update([SEP]);
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}
