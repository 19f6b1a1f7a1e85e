//! rspamd backend against the controller's HTTP API.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use mailwarden_content::{build_report, unwrap_report};
use mailwarden_core::{LearnKind, SpamVerdict};

use crate::SpamClassifier;

pub const RSPAMD_TIMEOUT: Duration = Duration::from_secs(20);

/// FAIL symbols caused by sender-side misconfiguration rather than a broken
/// scan. Any other `*FAIL` symbol aborts the check.
fn benign_fail_symbols() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(R_DKIM_PERMFAIL|DMARC_POLICY_SOFTFAIL|R_SPF_SOFTFAIL|DMARC_DNSFAIL|R_SPF_FAIL)$",
        )
        .expect("benign FAIL symbol pattern is valid")
    })
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    #[serde(default)]
    is_skipped: bool,
    score: f64,
    #[serde(default)]
    symbols: HashMap<String, serde_json::Value>,
    action: String,
}

pub struct Rspamd {
    client: reqwest::Client,
    controller: String,
    password: String,
}

impl Rspamd {
    /// Pings the controller once so a misconfigured endpoint surfaces at
    /// startup.
    pub async fn connect(controller: &str, password: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(RSPAMD_TIMEOUT)
            .build()
            .context("could not build http client")?;
        let rspamd = Self {
            client,
            controller: controller.trim_end_matches('/').to_string(),
            password: password.to_string(),
        };
        rspamd.ping().await.context("could not ping rspamd")?;
        Ok(rspamd)
    }

    async fn ping(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/ping", self.controller))
            .send()
            .await
            .context("could not reach rspamd")?;
        if response.status() != reqwest::StatusCode::OK {
            bail!("unexpected status {} from rspamd, expected 200", response.status());
        }
        Ok(())
    }
}

#[async_trait]
impl SpamClassifier for Rspamd {
    async fn check(&self, raw: &[u8]) -> Result<SpamVerdict> {
        let response = self
            .client
            .post(format!("{}/checkv2", self.controller))
            .header("Password", &self.password)
            .body(raw.to_vec())
            .send()
            .await
            .context("could not perform check request")?;
        if response.status() != reqwest::StatusCode::OK {
            bail!("unexpected status {} from rspamd, expected 200", response.status());
        }

        let body = response
            .bytes()
            .await
            .context("could not read rspamd response")?;
        verdict_from_response(raw, &body)
    }

    async fn learn(&self, kind: LearnKind, raw: &[u8]) -> Result<()> {
        let path = match kind {
            LearnKind::Spam => "learnspam",
            LearnKind::Ham => "learnham",
        };
        let unwrapped = unwrap_report(raw).context("could not unwrap spam report")?;

        let response = self
            .client
            .post(format!("{}/{path}", self.controller))
            .header("Password", &self.password)
            .body(unwrapped)
            .send()
            .await
            .context("could not perform learn request")?;

        // 204 = nothing to do, 208 = already learned.
        let status = response.status().as_u16();
        if !matches!(status, 200 | 204 | 208) {
            bail!("unexpected status {status} from rspamd, expected 200/204/208");
        }
        Ok(())
    }
}

fn verdict_from_response(raw: &[u8], response: &[u8]) -> Result<SpamVerdict> {
    let parsed: CheckResponse =
        serde_json::from_slice(response).context("could not deserialize rspamd response")?;

    if parsed.symbols.is_empty() {
        bail!("could not find any symbols in rspamd response");
    }
    for symbol in parsed.symbols.keys() {
        if symbol.ends_with("FAIL") && !benign_fail_symbols().is_match(symbol) {
            bail!("unexpected FAIL symbol {symbol} in rspamd response");
        }
    }

    debug!(
        action = %parsed.action,
        score = parsed.score,
        skipped = parsed.is_skipped,
        "rspamd verdict"
    );
    let is_spam = parsed.action != "no action";
    let report = if is_spam {
        build_report(raw, response, parsed.score, "rspamd").context("could not create report")?
    } else {
        Vec::new()
    };

    Ok(SpamVerdict {
        is_spam,
        score: parsed.score,
        report,
    })
}
