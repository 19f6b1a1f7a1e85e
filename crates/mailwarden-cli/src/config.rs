//! TOML configuration with PascalCase keys.

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

const DEFAULT_SPAMASSASSIN_HOST: &str = "127.0.0.1:783";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default)]
    pub imap_host: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub spamassassin_host: Option<String>,
    #[serde(default)]
    pub rspamd_controller: Option<String>,
    #[serde(default)]
    pub rspamd_password: Option<String>,

    #[serde(default = "default_true")]
    pub dry_run: bool,

    #[serde(default)]
    pub move_spam: bool,
    #[serde(default)]
    pub delete_spam: bool,
    #[serde(default)]
    pub spam_folder: Option<String>,
    #[serde(default)]
    pub append_reports: bool,
    #[serde(default)]
    pub report_folder: Option<String>,

    #[serde(default = "default_check_folders")]
    pub check_folders: Vec<String>,

    #[serde(default)]
    pub spam_learn_folders: Vec<String>,
    #[serde(default)]
    pub ham_learn_folders: Vec<String>,
    #[serde(default)]
    pub delete_learned: bool,

    #[serde(default)]
    pub loglevel: Option<String>,
}

fn default_database() -> String {
    "persistence.db".to_string()
}

fn default_true() -> bool {
    true
}

fn default_check_folders() -> Vec<String> {
    vec!["INBOX".to_string()]
}

fn normalize(field: &mut Option<String>) {
    if field.as_deref().map(str::trim).unwrap_or("").is_empty() {
        *field = None;
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("could not read config file {}", path.display()))?;
        Self::parse(&content)
    }

    fn parse(content: &str) -> Result<Config> {
        let mut config: Config = toml::from_str(content).context("could not parse config file")?;

        normalize(&mut config.spamassassin_host);
        normalize(&mut config.rspamd_controller);
        normalize(&mut config.rspamd_password);

        // The classic setup gets the spamd default; once rspamd is
        // configured, defaulting the other endpoint would make the choice
        // of classifier ambiguous.
        if config.spamassassin_host.is_none() && config.rspamd_controller.is_none() {
            config.spamassassin_host = Some(DEFAULT_SPAMASSASSIN_HOST.to_string());
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.database.trim().is_empty() {
            bail!("Database must not be empty, set to a filename for the sqlite database");
        }
        if self.imap_host.trim().is_empty() {
            bail!("ImapHost must not be empty, set to host:port of the imap server");
        }
        if self.user.trim().is_empty() {
            bail!("User must not be empty, set to the username on the imap server");
        }
        if self.password.trim().is_empty() {
            bail!("Password must not be empty, set to the password of User on the imap server");
        }

        if self.spamassassin_host.is_some() && self.rspamd_controller.is_some() {
            bail!("SpamassassinHost and RspamdController cannot be used at the same time");
        }
        if self.rspamd_controller.is_some() && self.rspamd_password.is_none() {
            bail!("RspamdPassword must be set when RspamdController is used");
        }

        self.imap_addr()?;
        Ok(())
    }

    /// Splits `ImapHost` into host and port.
    pub fn imap_addr(&self) -> Result<(String, u16)> {
        let (host, port) = self
            .imap_host
            .rsplit_once(':')
            .with_context(|| format!("ImapHost {} must be host:port", self.imap_host))?;
        if host.is_empty() {
            bail!("ImapHost {} must be host:port", self.imap_host);
        }
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid port in ImapHost {}", self.imap_host))?;
        Ok((host.to_string(), port))
    }
}
