//! Fingerprint engine: content identity and thread-hint derivation.
//!
//! Pure and deterministic. Two records with different surface formatting
//! (subject prefixes, casing, whitespace, quoted-reply echoes) but
//! identical substantive content must yield the same fingerprint, because
//! the fingerprint is the dedup key and collisions are not tolerated in
//! the other direction either: the digest covers the full normalized
//! (subject, sender, body) triple.
//!
//! The engine also emits a [`ThreadHint`]: the record's candidate ancestor
//! ids nearest-first plus a deterministic subject+sender fallback key.
//! Resolving which candidate maps to an existing thread requires state and
//! belongs to the assembler; keeping the candidates-only split is what
//! keeps this module pure.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::models::{EmailRecord, MessageFingerprint, ThreadHint, ThreadKey};

/// Lazy-initialized regex matching echoed header lines inside a body.
static HEADER_ECHO_REGEX: OnceLock<Regex> = OnceLock::new();

/// Lazy-initialized regex matching a quoted-reply boundary line, e.g.
/// `On Mon, Jan 13, Alice wrote:` or `-----Original Message-----`.
static QUOTE_BOUNDARY_REGEX: OnceLock<Regex> = OnceLock::new();

fn header_echo_regex() -> &'static Regex {
    HEADER_ECHO_REGEX
        .get_or_init(|| Regex::new(r"(?i)^(From|To|Cc|Subject):\s*").expect("invalid header regex"))
}

fn quote_boundary_regex() -> &'static Regex {
    QUOTE_BOUNDARY_REGEX.get_or_init(|| {
        Regex::new(r"(?i)(wrote:\s*$|^-{2,}\s*Original Message\s*-{2,}$)")
            .expect("invalid boundary regex")
    })
}

/// A record that lacks the minimum content to fingerprint.
#[derive(Debug, Error, PartialEq)]
pub enum FingerprintError {
    #[error("record has empty subject and empty body")]
    EmptyContent,
}

/// Normalize a subject for identity comparison.
///
/// Repeatedly strips reply/forward prefixes (`Re:`, `Fwd:`, `Fw:`, `Aw:`)
/// and bracketed list tags (`[PATCH v2]`, `[RFC]`, ...) until stable, then
/// collapses whitespace. Already lowercased on entry to the loop so the
/// prefix match is case-insensitive.
pub fn normalize_subject(subject: &str) -> String {
    let mut normalized = subject.trim().to_lowercase();

    // Keep removing prefixes until none match
    loop {
        let before = normalized.clone();

        for prefix in &["re:", "fwd:", "fw:", "aw:"] {
            if normalized.starts_with(prefix) {
                normalized = normalized[prefix.len()..].trim_start().to_string();
            }
        }

        if normalized.starts_with('[') {
            if let Some(end_bracket) = normalized.find(']') {
                normalized = normalized[end_bracket + 1..].trim_start().to_string();
            }
        }

        if before == normalized {
            break;
        }
    }

    let words: Vec<&str> = normalized.split_whitespace().collect();
    words.join(" ")
}

/// Normalize a sender address: trimmed and lowercased.
pub fn normalize_sender(sender: &str) -> String {
    sender.trim().to_lowercase()
}

/// Strip quoted-reply content from a body.
///
/// Drops `>`-quoted lines, and everything at or below the first quote
/// boundary line (a trailing `wrote:` attribution or an
/// `-----Original Message-----` separator), so a reply that merely echoes
/// its parent's body carries no content beyond the boundary.
fn strip_quoted_reply(body: &str) -> String {
    let mut kept = Vec::new();
    for line in body.lines() {
        let trimmed = line.trim_start();
        if quote_boundary_regex().is_match(trimmed) {
            break;
        }
        if trimmed.starts_with('>') {
            continue;
        }
        kept.push(line);
    }
    kept.join("\n")
}

/// Normalize body text for digesting.
///
/// After quote-stripping: drop echoed `From:/To:/Cc:/Subject:` header
/// lines, lowercase, drop non-alphanumerics except spaces, collapse
/// whitespace.
pub fn normalize_body(body: &str) -> String {
    let stripped = strip_quoted_reply(body);

    let mut text = String::with_capacity(stripped.len());
    for line in stripped.lines() {
        let line = header_echo_regex().replace(line.trim_start(), "");
        text.push_str(&line);
        text.push('\n');
    }

    let text: String = text
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c
            } else {
                ' '
            }
        })
        .collect();

    let words: Vec<&str> = text.split_whitespace().collect();
    words.join(" ")
}

/// Compute the dedup fingerprint of a record.
///
/// SHA-256 over the normalized (subject, sender, body) triple, rendered as
/// lowercase hex. Fails only when both subject and body are empty: such a
/// record has no substantive content to identify and is dead-lettered.
pub fn fingerprint(record: &EmailRecord) -> Result<MessageFingerprint, FingerprintError> {
    if record.subject.trim().is_empty() && record.body_text.trim().is_empty() {
        return Err(FingerprintError::EmptyContent);
    }

    let subject = normalize_subject(&record.subject);
    let sender = normalize_sender(&record.sender);
    let body = normalize_body(&record.body_text);

    let mut hasher = Sha256::new();
    hasher.update(subject.as_bytes());
    hasher.update([0u8]);
    hasher.update(sender.as_bytes());
    hasher.update([0u8]);
    hasher.update(body.as_bytes());

    Ok(MessageFingerprint {
        digest: format!("{:x}", hasher.finalize()),
    })
}

/// Derive the candidate thread identities for a record.
///
/// Ancestors are read from `parent_refs` right-to-left so the nearest
/// ancestor comes first; duplicates keep their first (nearest) position.
/// The fallback is the deterministic subject+sender key, so redelivery and
/// permutation cannot mint divergent keys for the same fallback identity.
pub fn thread_hint(record: &EmailRecord) -> ThreadHint {
    let mut ancestors: Vec<String> = Vec::with_capacity(record.parent_refs.len());
    for ancestor in record.parent_refs.iter().rev() {
        if !ancestors.contains(ancestor) {
            ancestors.push(ancestor.clone());
        }
    }

    ThreadHint {
        ancestors,
        fallback: fallback_key(&record.subject, &record.sender),
    }
}

/// Mint the deterministic fallback thread key for a subject+sender pair.
pub fn fallback_key(subject: &str, sender: &str) -> ThreadKey {
    let mut hasher = Sha256::new();
    hasher.update(normalize_subject(subject).as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize_sender(sender).as_bytes());
    ThreadKey(format!("subject-{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::record;

    #[test]
    fn test_normalize_subject() {
        assert_eq!(
            normalize_subject("Re: [PATCH] Fix memory leak"),
            "fix memory leak"
        );
        assert_eq!(
            normalize_subject("[PATCH v2 1/3] Add new feature"),
            "add new feature"
        );
        assert_eq!(normalize_subject("Re: Fwd: [RFC PATCH] Test"), "test");
        assert_eq!(
            normalize_subject("RE: re:   Important   fix"),
            "important fix"
        );
    }

    #[test]
    fn test_strip_quoted_reply_drops_quote_lines() {
        let body = "Fresh content.\n> old line one\n> old line two\nMore fresh content.";
        assert_eq!(
            strip_quoted_reply(body),
            "Fresh content.\nMore fresh content."
        );
    }

    #[test]
    fn test_strip_quoted_reply_stops_at_wrote_boundary() {
        let body = "Thanks, applied.\n\nOn Mon, 13 Jan 2025, Alice wrote:\n> the original\n> message body";
        assert_eq!(strip_quoted_reply(body), "Thanks, applied.\n");

        let body = "Agreed.\n-----Original Message-----\nFrom: Bob\nthe whole original";
        assert_eq!(strip_quoted_reply(body), "Agreed.");
    }

    #[test]
    fn test_normalize_body_strips_header_echoes_and_punctuation() {
        let body = "From: Alice <a@x>\nSubject: hi!\nHello, World -- again.";
        assert_eq!(normalize_body(body), "alice a x hi hello world again");
    }

    #[test]
    fn test_fingerprint_stability() {
        let a = record(
            "a@x",
            &[],
            "Re:  [tag] Quarterly Numbers",
            "The numbers look good.",
        );
        let mut b = record(
            "b@x",
            &[],
            "RE: re: [tag]   QUARTERLY numbers",
            "The numbers look good!\n> some quoted text\nOn Mon, Bob wrote:\n> more quoting",
        );
        b.sender = a.sender.clone();

        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn test_fingerprint_differs_on_substantive_content() {
        let a = record("a@x", &[], "Numbers", "The numbers look good.");
        let b = record("b@x", &[], "Numbers", "The numbers look bad.");
        assert_ne!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn test_fingerprint_differs_on_sender() {
        let a = record("a@x", &[], "Numbers", "Body.");
        let mut b = record("a@x", &[], "Numbers", "Body.");
        b.sender = "someone-else@example.com".into();
        assert_ne!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn test_fingerprint_rejects_empty_content() {
        let r = record("a@x", &[], "", "   ");
        assert_eq!(fingerprint(&r).unwrap_err(), FingerprintError::EmptyContent);
    }

    #[test]
    fn test_thread_hint_nearest_ancestor_first() {
        let r = record("d@x", &["a@x", "b@x", "c@x"], "subject", "body");
        let hint = thread_hint(&r);
        assert_eq!(hint.ancestors, vec!["c@x", "b@x", "a@x"]);
    }

    #[test]
    fn test_thread_hint_dedups_ancestors() {
        let r = record("d@x", &["a@x", "b@x", "a@x"], "subject", "body");
        let hint = thread_hint(&r);
        assert_eq!(hint.ancestors, vec!["a@x", "b@x"]);
    }

    #[test]
    fn test_fallback_key_deterministic() {
        let k1 = fallback_key("Re: Hello", "Alice@Example.com ");
        let k2 = fallback_key("hello", "alice@example.com");
        assert_eq!(k1, k2);
        assert!(k1.as_str().starts_with("subject-"));
    }
}
