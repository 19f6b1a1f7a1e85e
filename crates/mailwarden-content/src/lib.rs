//! Mail header inspection: stable message fingerprints, report unwrapping
//! and spam report synthesis.

use anyhow::{Context, Result, bail};
use mailparse::{MailHeader, MailHeaderMap, parse_headers, parse_mail};
use sha2::{Digest, Sha256};

/// Subject and identity extracted from a message's header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderInfo {
    pub subject: String,
    pub fingerprint: String,
}

/// Parses the header block of `raw` and derives the message fingerprint:
/// SHA-256 over all `Message-Id` values followed by all `Received` values,
/// in order of appearance. Uids get reassigned by the server, these headers
/// don't.
///
/// Fails when the message carries neither header, since there is nothing
/// stable to identify it by, and when the subject cannot be decoded.
pub fn header_infos(raw: &[u8]) -> Result<HeaderInfo> {
    let (headers, _) = parse_headers(raw).context("could not parse mail headers")?;

    let message_ids = headers.get_all_values("Message-Id");
    let received = headers.get_all_values("Received");
    if message_ids.is_empty() && received.is_empty() {
        bail!("mail has neither a Message-Id nor a Received header");
    }

    let subject = match headers.get_first_header("Subject") {
        Some(header) => decoded_subject(header)?,
        None => String::new(),
    };

    let mut sha = Sha256::new();
    for value in message_ids.iter().chain(received.iter()) {
        sha.update(value.as_bytes());
    }

    Ok(HeaderInfo {
        subject,
        fingerprint: format!("{:x}", sha.finalize()),
    })
}

/// mailparse decodes RFC 2047 encoded words leniently: a word it cannot
/// decode stays in the value verbatim, and undecodable bytes in a known
/// charset come out as U+FFFD. Either one is a failed decode.
fn decoded_subject(header: &MailHeader) -> Result<String> {
    let value = header.get_value();
    if value.contains('\u{FFFD}') || contains_encoded_word(&value) {
        bail!("could not decode subject header");
    }
    Ok(value)
}

fn contains_encoded_word(value: &str) -> bool {
    let mut rest = value;
    while let Some(start) = rest.find("=?") {
        let candidate = &rest[start + 2..];
        if let Some(end) = candidate.find("?=") {
            // =?charset?encoding?text?= leaves two inner separators.
            if candidate[..end].matches('?').count() >= 2 {
                return true;
            }
        }
        rest = candidate;
    }
    false
}

/// Extracts the original message out of a spam report generated by a prior
/// run, so training feeds the offending mail rather than our wrapper.
///
/// A report is a multipart message carrying at least two `X-Spam-*` headers;
/// the original lives in the part whose Content-Type is tagged
/// `x-spam-type=original`. Anything else is returned unchanged, which makes
/// the operation idempotent.
pub fn unwrap_report(raw: &[u8]) -> Result<Vec<u8>> {
    let parsed = parse_mail(raw).context("could not parse mail")?;

    if !parsed.ctype.mimetype.starts_with("multipart/") {
        return Ok(raw.to_vec());
    }

    let spam_headers = parsed
        .get_headers()
        .into_iter()
        .filter(|h| h.get_key_ref().to_ascii_lowercase().contains("x-spam-"))
        .count();
    if spam_headers < 2 {
        return Ok(raw.to_vec());
    }

    for part in &parsed.subparts {
        if part.ctype.params.get("x-spam-type").map(String::as_str) == Some("original") {
            return part
                .get_body_raw()
                .context("could not read wrapped original mail");
        }
    }

    Ok(raw.to_vec())
}

/// Truncates a subject for log output.
pub fn short_subject(subject: &str) -> String {
    let mut short: String = subject.chars().take(30).collect();
    if short.len() < subject.len() {
        short.push('…');
    }
    short
}

/// Builds the report mail appended to the report folder for a spam hit: an
/// inline text part with the classifier's response plus the untouched
/// original as a `message/rfc822; x-spam-type=original` attachment, the
/// marker [`unwrap_report`] looks for.
pub fn build_report(
    raw: &[u8],
    classifier_response: &[u8],
    score: f64,
    checker: &str,
) -> Result<Vec<u8>> {
    let infos = header_infos(raw).context("could not read mail for report")?;
    let boundary = format!("mw-report-{}", &infos.fingerprint[..16]);
    let flag = "*".repeat(score.round().max(0.0) as usize);
    let date = chrono::Utc::now().to_rfc2822();

    let mut report = Vec::with_capacity(raw.len() + classifier_response.len() + 1024);
    report.extend_from_slice(
        format!(
            "From: mailwarden <mailwarden@localhost>\r\n\
             To: mailwarden <mailwarden@localhost>\r\n\
             Subject: {subject}\r\n\
             Date: {date}\r\n\
             MIME-Version: 1.0\r\n\
             X-Spam-Checker-Version: {checker}\r\n\
             X-Spam-Flag: {flag}\r\n\
             X-Spam-Status: Yes, score={score:.1}\r\n\
             Content-Type: multipart/mixed; boundary=\"{boundary}\"\r\n\
             \r\n\
             --{boundary}\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             Content-Disposition: inline\r\n\
             \r\n\
             {checker} flagged the attached mail as spam:\r\n\
             \r\n",
            subject = infos.subject,
        )
        .as_bytes(),
    );
    report.extend_from_slice(classifier_response);
    report.extend_from_slice(
        format!(
            "\r\n\
             --{boundary}\r\n\
             Content-Type: message/rfc822; x-spam-type=original\r\n\
             Content-Description: original message\r\n\
             Content-Disposition: attachment; filename=\"original-mail.eml\"\r\n\
             Content-Transfer-Encoding: binary\r\n\
             \r\n"
        )
        .as_bytes(),
    );
    report.extend_from_slice(raw);
    report.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    Ok(report)
}
