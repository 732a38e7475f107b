//! Raw record parsing and normalization.
//!
//! Turns raw RFC 5322 bytes into a structured [`EmailRecord`] at the
//! producer boundary, as a pure function: every header quirk either maps
//! cleanly into the record or produces a [`NormalizeError`], never an
//! exception-style control flow.
//!
//! A record survives normalization when it has a sender and a valid,
//! non-future date. The Message-ID is kept when present and usable, but a
//! missing or malformed one is not fatal: dedup is fingerprint-keyed, and
//! threading synthesizes a node id from the fingerprint. Records rejected
//! here are dead-lettered by the worker with the error's reason string,
//! not retried.

use chrono::{DateTime, Duration, Utc};
use mailparse::{MailHeaderMap, parse_mail};
use thiserror::Error;

use crate::models::EmailRecord;

/// Maximum tolerated clock skew for future-dated records.
const MAX_FUTURE_SKEW: Duration = Duration::hours(24);

/// Reasons a raw record cannot be normalized into an [`EmailRecord`].
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("failed to parse MIME structure: {0}")]
    MimeParse(#[from] mailparse::MailParseError),
    #[error("missing sender address")]
    MissingSender,
    #[error("missing Date header")]
    MissingDate,
    #[error("invalid Date header `{raw}`: {error}")]
    InvalidDate { raw: String, error: String },
    #[error("future Date header `{raw}`")]
    FutureDate { raw: String },
}

/// Sanitize text by removing NUL bytes that PostgreSQL cannot store.
fn sanitize_text(text: &str) -> String {
    text.replace('\0', "").trim().to_string()
}

/// Clean message ids by removing angle brackets and whitespace.
fn normalize_message_id(msg_id: Option<String>) -> Option<String> {
    msg_id.and_then(|id| {
        let cleaned = id.trim().trim_matches(&['<', '>'][..]).trim();
        if cleaned.is_empty() {
            None
        } else {
            Some(sanitize_text(cleaned))
        }
    })
}

/// Extract message ids from a References header value.
/// Whitespace-based splitting for compatibility with loose producers.
fn extract_references(header_value: &str) -> Vec<String> {
    header_value
        .split_whitespace()
        .map(|id| {
            let cleaned = id.trim().trim_matches(&['<', '>'][..]);
            sanitize_text(cleaned)
        })
        .filter(|id| !id.is_empty())
        .collect()
}

/// Build the oldest-first ancestor chain from References and In-Reply-To.
///
/// References already lists oldest-first. In-Reply-To names the immediate
/// parent, so it belongs at the end of the chain when the references did
/// not already close with it.
fn build_parent_refs(references: Vec<String>, in_reply_to: Option<String>) -> Vec<String> {
    let mut refs = references;
    if let Some(parent) = in_reply_to {
        if refs.last() != Some(&parent) {
            refs.retain(|r| r != &parent);
            refs.push(parent);
        }
    }
    refs
}

/// Parse a raw record into a structured [`EmailRecord`].
///
/// Required: a sender address and a valid, non-future Date. Optional with
/// defaults: Message-ID (`None`), Subject (empty), body (empty, taking the
/// first `text/plain` part of multipart content). All text fields are
/// sanitized of NUL bytes.
pub fn normalize(raw: &[u8]) -> Result<EmailRecord, NormalizeError> {
    let parsed = parse_mail(raw).map_err(|e| {
        log::debug!("failed to parse MIME: {}", e);
        NormalizeError::MimeParse(e)
    })?;

    let message_id = normalize_message_id(parsed.headers.get_first_value("Message-ID"));

    let subject = parsed
        .headers
        .get_first_value("Subject")
        .map(|s| sanitize_text(&s))
        .unwrap_or_default();

    // Sender: the address part of From, lowercased.
    let from_str = parsed.headers.get_first_value("From").unwrap_or_default();
    let sender = match mailparse::addrparse(&from_str) {
        Ok(addrs) => match addrs.iter().next() {
            Some(mailparse::MailAddr::Single(info)) => info.addr.to_lowercase(),
            _ => String::new(),
        },
        Err(_) => String::new(),
    };

    if sender.is_empty() {
        log::debug!(
            "record {} missing sender, rejecting",
            message_id.as_deref().unwrap_or("<no id>")
        );
        return Err(NormalizeError::MissingSender);
    }

    let timestamp = parse_record_date(parsed.headers.get_first_value("Date"), &message_id)?;

    // Body: single-part directly, multipart takes the first text/plain part
    // and falls back to the root body.
    let body = if parsed.subparts.is_empty() {
        parsed.get_body().unwrap_or_default()
    } else {
        let mut body_text = String::new();
        for part in &parsed.subparts {
            if part.ctype.mimetype.as_str() == "text/plain" {
                body_text = part.get_body().unwrap_or_default();
                break;
            }
        }
        if body_text.is_empty() {
            parsed.get_body().unwrap_or_default()
        } else {
            body_text
        }
    };
    let body_text = sanitize_text(&body);

    let references = parsed
        .headers
        .get_first_value("References")
        .map(|v| extract_references(&v))
        .unwrap_or_default();
    let in_reply_to = normalize_message_id(parsed.headers.get_first_value("In-Reply-To"));
    let parent_refs = build_parent_refs(references, in_reply_to);

    log::trace!(
        "normalized: {} - {}",
        message_id.as_deref().unwrap_or("<no id>"),
        subject
    );

    Ok(EmailRecord {
        message_id,
        parent_refs,
        subject,
        sender,
        timestamp,
        body_text,
    })
}

fn parse_record_date(
    raw_date: Option<String>,
    message_id: &Option<String>,
) -> Result<DateTime<Utc>, NormalizeError> {
    let id = message_id.as_deref().unwrap_or("<no id>");
    let raw = raw_date.unwrap_or_default();
    if raw.trim().is_empty() {
        log::warn!("record {} missing Date header, rejecting", id);
        return Err(NormalizeError::MissingDate);
    }

    match dateparser::parse(&raw) {
        Ok(dt) => {
            let utc = dt.with_timezone(&Utc);
            let now = Utc::now();
            if utc > now + MAX_FUTURE_SKEW {
                log::warn!(
                    "record {} has future date `{}` (> {} hours ahead), rejecting",
                    id,
                    raw,
                    MAX_FUTURE_SKEW.num_hours()
                );
                Err(NormalizeError::FutureDate { raw })
            } else {
                Ok(utc)
            }
        }
        Err(source) => {
            log::warn!("record {} has invalid date `{}`, rejecting: {}", id, raw, source);
            Err(NormalizeError::InvalidDate {
                raw,
                error: source.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::raw_record;

    #[test]
    fn test_sanitize_text() {
        assert_eq!(sanitize_text("hello\0world"), "helloworld");
        assert_eq!(sanitize_text("  test  "), "test");
    }

    #[test]
    fn test_normalize_message_id() {
        assert_eq!(
            normalize_message_id(Some("<test@example.com>".to_string())),
            Some("test@example.com".to_string())
        );
        assert_eq!(normalize_message_id(Some("".to_string())), None);
        assert_eq!(normalize_message_id(None), None);
    }

    #[test]
    fn test_extract_references() {
        let refs = extract_references("<msg1@example.com> <msg2@example.com>");
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0], "msg1@example.com");
        assert_eq!(refs[1], "msg2@example.com");
    }

    #[test]
    fn test_build_parent_refs_appends_in_reply_to() {
        let refs = build_parent_refs(
            vec!["a@x".into(), "b@x".into()],
            Some("c@x".to_string()),
        );
        assert_eq!(refs, vec!["a@x", "b@x", "c@x"]);

        // Already last: no duplication.
        let refs = build_parent_refs(vec!["a@x".into(), "b@x".into()], Some("b@x".to_string()));
        assert_eq!(refs, vec!["a@x", "b@x"]);

        // Mentioned earlier in the chain: moved to the end.
        let refs = build_parent_refs(vec!["b@x".into(), "a@x".into()], Some("b@x".to_string()));
        assert_eq!(refs, vec!["a@x", "b@x"]);
    }

    #[test]
    fn test_normalize_full_record() {
        let raw = raw_record(
            Some("msg1@example.com"),
            &["root@example.com"],
            "Re: Hello",
            "alice@example.com",
            "Mon, 13 Jan 2025 10:00:00 +0000",
            "A body line.",
        );

        let record = normalize(raw.as_bytes()).unwrap();
        assert_eq!(record.message_id.as_deref(), Some("msg1@example.com"));
        assert_eq!(record.parent_refs, vec!["root@example.com"]);
        assert_eq!(record.subject, "Re: Hello");
        assert_eq!(record.sender, "alice@example.com");
        assert_eq!(record.body_text, "A body line.");
    }

    #[test]
    fn test_normalize_tolerates_missing_message_id() {
        let raw = concat!(
            "Subject: No id\r\n",
            "From: Tester <tester@example.com>\r\n",
            "Date: Mon, 13 Jan 2025 10:00:00 +0000\r\n",
            "\r\n",
            "Body\r\n"
        );

        let record = normalize(raw.as_bytes()).unwrap();
        assert_eq!(record.message_id, None);
    }

    #[test]
    fn test_normalize_rejects_missing_sender() {
        let raw = concat!(
            "Message-ID: <missing-from@test>\r\n",
            "Subject: Missing From\r\n",
            "Date: Mon, 13 Jan 2025 10:00:00 +0000\r\n",
            "\r\n",
            "Body\r\n"
        );

        let err = normalize(raw.as_bytes()).unwrap_err();
        assert!(matches!(err, NormalizeError::MissingSender));
    }

    #[test]
    fn test_normalize_rejects_missing_date() {
        let raw = concat!(
            "Message-ID: <missing-date@test>\r\n",
            "Subject: Missing Date\r\n",
            "From: Tester <tester@example.com>\r\n",
            "\r\n",
            "Body\r\n"
        );

        let err = normalize(raw.as_bytes()).unwrap_err();
        assert!(matches!(err, NormalizeError::MissingDate));
    }

    #[test]
    fn test_normalize_rejects_invalid_date() {
        let raw = concat!(
            "Message-ID: <invalid-date@test>\r\n",
            "Subject: Invalid Date\r\n",
            "From: Tester <tester@example.com>\r\n",
            "Date: not-a-real-date\r\n",
            "\r\n",
            "Body\r\n"
        );

        let err = normalize(raw.as_bytes()).unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidDate { .. }));
    }

    #[test]
    fn test_normalize_rejects_future_date() {
        let future = Utc::now() + Duration::days(10);
        let raw = format!(
            "Message-ID: <future-date@test>\r\nSubject: Future Date\r\nFrom: Tester <tester@example.com>\r\nDate: {}\r\n\r\nBody\r\n",
            future.to_rfc2822()
        );

        let err = normalize(raw.as_bytes()).unwrap_err();
        assert!(matches!(err, NormalizeError::FutureDate { .. }));
    }
}
