use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};

use mailwarden_classify::{ClassifierPool, Rspamd, SpamAssassin, SpamClassifier};
use mailwarden_core::{EngineOptions, LearnKind, SpamEngine, SqliteStateStore};
use mailwarden_mail::ImapSession;

mod config;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "mailwarden", version, about = "IMAP spam filtering reconciler")]
struct Cli {
    /// Path to the TOML configuration.
    #[arg(short = 'c', long = "config", default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("could not load config {}", cli.config.display()))?;

    init_logging(config.loglevel.as_deref().unwrap_or("info"));

    let store = SqliteStateStore::connect(&config.database)
        .await
        .context("could not connect to database")?;

    let classifier: Arc<dyn SpamClassifier> = if let Some(host) = &config.spamassassin_host {
        info!(classifier = "spamassassin", host = %host, "using SpamAssassin");
        Arc::new(
            SpamAssassin::connect(host)
                .await
                .context("could not start SpamAssassin connector")?,
        )
    } else if let Some(controller) = &config.rspamd_controller {
        let controller = controller.trim_end_matches('/');
        info!(classifier = "rspamd", controller = %controller, "using rspamd");
        Arc::new(
            Rspamd::connect(
                controller,
                config.rspamd_password.as_deref().unwrap_or_default(),
            )
            .await
            .context("could not start rspamd connector")?,
        )
    } else {
        bail!("no classifier configured");
    };

    let (host, port) = config.imap_addr()?;
    let imap = ImapSession::connect(&host, port, &config.user, &config.password)
        .context("could not start imap connector")?;

    let options = EngineOptions {
        dry_run: config.dry_run,
        delete_spam: config.delete_spam,
        move_spam: config.move_spam,
        spam_folder: config.spam_folder.clone(),
        append_reports: config.append_reports,
        report_folder: config.report_folder.clone(),
        delete_learned: config.delete_learned,
    };
    let mut engine = SpamEngine::new(store, ClassifierPool::new(classifier), imap, options)
        .context("could not start spam engine")?;

    if !config.spam_learn_folders.is_empty() || !config.ham_learn_folders.is_empty() {
        info!(
            spamfolders = ?config.spam_learn_folders,
            hamfolders = ?config.ham_learn_folders,
            deletelearned = config.delete_learned,
            dryrun = config.dry_run,
            "learning mails"
        );
        if config.delete_learned {
            if config.dry_run {
                warn!("skipping deletion of learned mails due to dry-run");
            } else {
                info!("learned mails will be deleted from the server afterwards");
            }
        } else {
            info!("not deleting mails after learning them");
        }

        if !config.spam_learn_folders.is_empty() {
            engine
                .learn(LearnKind::Spam, &config.spam_learn_folders)
                .await
                .context("learning spam failed")?;
        }
        if !config.ham_learn_folders.is_empty() {
            engine
                .learn(LearnKind::Ham, &config.ham_learn_folders)
                .await
                .context("learning ham failed")?;
        }
    }

    info!(
        folders = ?config.check_folders,
        dryrun = config.dry_run,
        spamfolder = ?config.spam_folder,
        "checking mails for spam"
    );
    if config.dry_run {
        warn!("skipping mutations and report generation due to dry-run");
    }
    engine
        .check_spam(&config.check_folders)
        .await
        .context("checking spam failed")?;

    engine.close().context("could not close imap session")?;
    Ok(())
}

fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    // tracing has no fatal or panic levels; both collapse to error.
    let level = match level.to_ascii_lowercase().as_str() {
        "debug" => "debug",
        "warn" => "warn",
        "error" | "fatal" | "panic" => "error",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
