//! Domain types, collaborator contracts and the reconciliation engine.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

pub mod engine;
pub mod store;

pub use engine::{BATCH_SIZE, CHECK_CONCURRENCY, EngineOptions, LEARN_CONCURRENCY, SpamEngine};
pub use store::SqliteStateStore;

/// Why a message row was recorded: classified, or fed to the trainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MailClass {
    Checked,
    LearnedSpam,
    LearnedHam,
}

impl MailClass {
    /// Persisted role code. The gap leaves room for further check roles.
    pub fn code(self) -> i64 {
        match self {
            MailClass::Checked => 0,
            MailClass::LearnedSpam => 10,
            MailClass::LearnedHam => 11,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(MailClass::Checked),
            10 => Some(MailClass::LearnedSpam),
            11 => Some(MailClass::LearnedHam),
            _ => None,
        }
    }
}

/// Which corpus a training run feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnKind {
    Spam,
    Ham,
}

impl LearnKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LearnKind::Spam => "spam",
            LearnKind::Ham => "ham",
        }
    }

    pub fn class(self) -> MailClass {
        match self {
            LearnKind::Spam => MailClass::LearnedSpam,
            LearnKind::Ham => MailClass::LearnedHam,
        }
    }
}

/// A folder the engine has completed at least one pass over, together with
/// the uidvalidity that was current when its last batch was committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderRecord {
    pub name: String,
    pub uidvalidity: u32,
}

/// A persisted message row.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedMail {
    pub id: i64,
    pub class: MailClass,
    pub uid: u32,
    pub fingerprint: String,
    pub folder: String,
    pub subject: String,
    pub is_spam: Option<bool>,
    pub score: Option<f64>,
}

/// A message row about to be persisted. `is_spam` and `score` are set only
/// for [`MailClass::Checked`] rows whose classification succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMail {
    pub class: MailClass,
    pub uid: u32,
    pub fingerprint: String,
    pub folder: String,
    pub subject: String,
    pub is_spam: Option<bool>,
    pub score: Option<f64>,
}

/// A fully fetched message. The raw body is held only for the duration of
/// one batch and never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedMail {
    pub uid: u32,
    pub subject: String,
    pub fingerprint: String,
    pub raw: Vec<u8>,
}

/// Identity headers of a message, fetched without the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdHeader {
    pub uid: u32,
    pub subject: String,
    pub fingerprint: String,
}

/// Outcome of classifying a single message. `report` carries the
/// classifier's report mail and is only populated for spam.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpamVerdict {
    pub is_spam: bool,
    pub score: f64,
    pub report: Vec<u8>,
}

/// Durable record of folder uidvalidity cookies and role-tagged message
/// rows. Rows are only ever created or uid-refreshed, never deleted.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn all_folders(&self) -> Result<Vec<FolderRecord>>;

    /// Upserts a folder record by name.
    async fn save_folder(&self, name: &str, uidvalidity: u32) -> Result<()>;

    async fn mails_in_folder(&self, class: MailClass, folder: &str) -> Result<Vec<SavedMail>>;

    async fn find_mail_by_fingerprint(
        &self,
        class: MailClass,
        folder: &str,
        fingerprint: &str,
    ) -> Result<Option<SavedMail>>;

    /// Returns the subset of `fingerprints` already recorded under `class`.
    async fn fingerprints_exist(
        &self,
        class: MailClass,
        fingerprints: &[String],
    ) -> Result<HashSet<String>>;

    /// Must affect exactly one row.
    async fn update_uid(&self, id: i64, uid: u32) -> Result<()>;

    /// Inserts all rows atomically; a partial failure persists nothing.
    async fn save_mails(&self, mails: &[NewMail]) -> Result<()>;
}

/// One authenticated session against the message store, with one currently
/// selected folder. Delete and move run through capability-dependent
/// strategies whose readiness predicates guard the destructive fallbacks.
pub trait ImapConnector: Send {
    /// Selects `folder` and returns its uidvalidity.
    fn select(&mut self, folder: &str) -> Result<u32>;

    fn list_uids(&mut self) -> Result<Vec<u32>>;

    /// Fetches full bodies. Results come back in server delivery order, not
    /// necessarily uid order.
    fn fetch_mails(&mut self, uids: &[u32]) -> Result<Vec<FetchedMail>>;

    fn fetch_id_headers(&mut self, uids: &[u32]) -> Result<Vec<IdHeader>>;

    /// Appends a new message into `folder`.
    fn put(&mut self, body: &[u8], folder: &str) -> Result<()>;

    fn delete(&mut self, uids: &[u32]) -> Result<()>;

    /// `None` when deleting is safe; otherwise the reason it is not.
    fn delete_ready(&mut self) -> Result<Option<String>>;

    fn move_mails(&mut self, uids: &[u32], folder: &str) -> Result<()>;

    fn move_ready(&mut self) -> Result<Option<String>>;

    fn close(&mut self) -> Result<()>;
}

/// Batched classification over any single-message classifier, bounded by a
/// fixed worker count, with one automatic retry per failing item. Output is
/// index-aligned with input.
#[async_trait]
pub trait BatchClassifier: Send + Sync {
    async fn check_all(
        &self,
        mails: Vec<Vec<u8>>,
        concurrency: usize,
    ) -> Vec<Result<SpamVerdict>>;

    async fn learn_all(
        &self,
        kind: LearnKind,
        mails: Vec<Vec<u8>>,
        concurrency: usize,
    ) -> Vec<Result<()>>;
}
