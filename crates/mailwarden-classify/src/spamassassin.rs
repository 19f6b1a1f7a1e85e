//! SpamAssassin backend, speaking the `spamd` SPAMC line protocol.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use mailwarden_content::unwrap_report;
use mailwarden_core::{LearnKind, SpamVerdict};

use crate::SpamClassifier;

pub const SPAMASSASSIN_TIMEOUT: Duration = Duration::from_secs(20);
const PROTOCOL_VERSION: &str = "SPAMC/1.5";

/// Client for a running `spamd`. Every call is one TCP exchange: write the
/// request, half-close, read the response to EOF.
pub struct SpamAssassin {
    addr: String,
}

impl SpamAssassin {
    /// Pings once so a misconfigured endpoint surfaces at startup.
    pub async fn connect(addr: &str) -> Result<Self> {
        let sa = Self {
            addr: addr.to_string(),
        };
        let response = sa
            .exchange("PING", &[], &[])
            .await
            .context("could not ping spamd")?;
        if !response.status.contains("PONG") {
            bail!("unexpected ping response from spamd: {}", response.status);
        }
        Ok(sa)
    }

    async fn exchange(
        &self,
        command: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<SpamdResponse> {
        timeout(
            SPAMASSASSIN_TIMEOUT,
            self.exchange_inner(command, headers, body),
        )
        .await
        .with_context(|| format!("spamd {command} timed out"))?
    }

    async fn exchange_inner(
        &self,
        command: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<SpamdResponse> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("could not connect to spamd at {}", self.addr))?;

        let mut request = format!("{command} {PROTOCOL_VERSION}\r\n");
        if !body.is_empty() {
            request.push_str(&format!("Content-length: {}\r\n", body.len()));
        }
        for (name, value) in headers {
            request.push_str(&format!("{name}: {value}\r\n"));
        }
        request.push_str("\r\n");

        stream
            .write_all(request.as_bytes())
            .await
            .context("could not send spamd request")?;
        stream
            .write_all(body)
            .await
            .context("could not send spamd request body")?;
        stream
            .shutdown()
            .await
            .context("could not half-close spamd request")?;

        let mut response = Vec::new();
        stream
            .read_to_end(&mut response)
            .await
            .context("could not read spamd response")?;
        parse_response(&response)
    }
}

#[async_trait]
impl SpamClassifier for SpamAssassin {
    async fn check(&self, raw: &[u8]) -> Result<SpamVerdict> {
        let response = self.exchange("PROCESS", &[], raw).await?;
        let spam_header = response
            .header("Spam")
            .context("spamd response carried no Spam header")?;
        let (is_spam, score) = parse_spam_header(spam_header)?;
        debug!(is_spam, score, "spamd verdict");

        // PROCESS returns the mail rewritten with SpamAssassin's report;
        // that is what gets appended to the report folder.
        let report = if is_spam { response.body } else { Vec::new() };
        Ok(SpamVerdict {
            is_spam,
            score,
            report,
        })
    }

    async fn learn(&self, kind: LearnKind, raw: &[u8]) -> Result<()> {
        let unwrapped = unwrap_report(raw).context("could not unwrap spam report")?;
        let headers = [("Message-class", kind.as_str()), ("Set", "local")];
        self.exchange("TELL", &headers, &unwrapped).await?;
        Ok(())
    }
}

#[derive(Debug)]
struct SpamdResponse {
    status: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl SpamdResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

fn parse_response(raw: &[u8]) -> Result<SpamdResponse> {
    let (head, body) = match find_subslice(raw, b"\r\n\r\n") {
        Some(pos) => (&raw[..pos], raw[pos + 4..].to_vec()),
        None => (raw, Vec::new()),
    };
    let head = std::str::from_utf8(head).context("spamd response headers are not utf-8")?;

    let mut lines = head.split("\r\n");
    let status = lines.next().unwrap_or("").to_string();
    if !status.starts_with("SPAMD/") {
        bail!("unexpected spamd response status: {status}");
    }
    // "SPAMD/1.5 0 EX_OK"; a non-zero code is a server-side failure.
    let code = status.split_whitespace().nth(1).unwrap_or("");
    if code != "0" {
        bail!("spamd reported an error: {status}");
    }

    let mut headers = Vec::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(SpamdResponse {
        status,
        headers,
        body,
    })
}

/// Parses `True ; 10.5 / 5.0` from the `Spam:` response header.
fn parse_spam_header(value: &str) -> Result<(bool, f64)> {
    let (verdict, scores) = value
        .split_once(';')
        .with_context(|| format!("malformed Spam header: {value}"))?;
    let is_spam = matches!(
        verdict.trim().to_ascii_lowercase().as_str(),
        "true" | "yes"
    );
    let score = scores
        .split('/')
        .next()
        .unwrap_or("")
        .trim()
        .parse::<f64>()
        .with_context(|| format!("malformed score in Spam header: {value}"))?;
    Ok((is_spam, score))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
