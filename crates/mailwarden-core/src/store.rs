//! SQLite-backed [`StateStore`].

use std::collections::HashSet;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::{debug, info};

use crate::{FolderRecord, MailClass, NewMail, SavedMail, StateStore};

type MailRow = (
    i64,
    i64,
    i64,
    String,
    String,
    String,
    Option<bool>,
    Option<f64>,
);

pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub async fn connect(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        // Single writer; everything is driven from the orchestrator.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("could not open database {path}"))?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("could not migrate database")?;

        info!(file = %path, "connected to state database");
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn placeholders(count: usize) -> String {
    std::iter::repeat("?").take(count).collect::<Vec<_>>().join(", ")
}

fn saved_mail(row: MailRow) -> Result<SavedMail> {
    let (id, class, uid, fingerprint, folder, subject, is_spam, score) = row;
    let class = MailClass::from_code(class)
        .with_context(|| format!("message {id} has unknown class code {class}"))?;
    Ok(SavedMail {
        id,
        class,
        uid: uid as u32,
        fingerprint,
        folder,
        subject,
        is_spam,
        score,
    })
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn all_folders(&self) -> Result<Vec<FolderRecord>> {
        let rows = sqlx::query_as::<_, (String, i64)>("SELECT name, uidvalidity FROM folders")
            .fetch_all(&self.pool)
            .await
            .context("could not query folders")?;

        debug!(count = rows.len(), "loaded known folders");
        Ok(rows
            .into_iter()
            .map(|(name, uidvalidity)| FolderRecord {
                name,
                uidvalidity: uidvalidity as u32,
            })
            .collect())
    }

    async fn save_folder(&self, name: &str, uidvalidity: u32) -> Result<()> {
        sqlx::query(
            "INSERT INTO folders (name, uidvalidity) VALUES (?, ?)
             ON CONFLICT(name) DO UPDATE SET uidvalidity = excluded.uidvalidity",
        )
        .bind(name)
        .bind(uidvalidity as i64)
        .execute(&self.pool)
        .await
        .context("could not save folder")?;

        info!(folder = %name, uidvalidity, "persisted folder");
        Ok(())
    }

    async fn mails_in_folder(&self, class: MailClass, folder: &str) -> Result<Vec<SavedMail>> {
        let rows = sqlx::query_as::<_, MailRow>(
            "SELECT id, class, uid, fingerprint, foldername, subject, isspam, score
             FROM messages WHERE class = ? AND foldername = ?",
        )
        .bind(class.code())
        .bind(folder)
        .fetch_all(&self.pool)
        .await
        .context("could not query mails in folder")?;

        rows.into_iter().map(saved_mail).collect()
    }

    async fn find_mail_by_fingerprint(
        &self,
        class: MailClass,
        folder: &str,
        fingerprint: &str,
    ) -> Result<Option<SavedMail>> {
        let row = sqlx::query_as::<_, MailRow>(
            "SELECT id, class, uid, fingerprint, foldername, subject, isspam, score
             FROM messages WHERE class = ? AND foldername = ? AND fingerprint = ?",
        )
        .bind(class.code())
        .bind(folder)
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
        .context("could not query mail by fingerprint")?;

        row.map(saved_mail).transpose()
    }

    async fn fingerprints_exist(
        &self,
        class: MailClass,
        fingerprints: &[String],
    ) -> Result<HashSet<String>> {
        if fingerprints.is_empty() {
            return Ok(HashSet::new());
        }

        let query = format!(
            "SELECT fingerprint FROM messages WHERE class = ? AND fingerprint IN ({})",
            placeholders(fingerprints.len())
        );
        let mut q = sqlx::query_as::<_, (String,)>(&query).bind(class.code());
        for fingerprint in fingerprints {
            q = q.bind(fingerprint);
        }

        let rows = q
            .fetch_all(&self.pool)
            .await
            .context("could not query fingerprints")?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn update_uid(&self, id: i64, uid: u32) -> Result<()> {
        let result = sqlx::query("UPDATE messages SET uid = ? WHERE id = ?")
            .bind(uid as i64)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("could not update uid")?;

        if result.rows_affected() != 1 {
            bail!(
                "unexpected number of affected rows, expected 1 got {}",
                result.rows_affected()
            );
        }
        Ok(())
    }

    async fn save_mails(&self, mails: &[NewMail]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("could not start transaction")?;

        for mail in mails {
            sqlx::query(
                "INSERT INTO messages (class, uid, fingerprint, foldername, subject, isspam, score)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(mail.class.code())
            .bind(mail.uid as i64)
            .bind(&mail.fingerprint)
            .bind(&mail.folder)
            .bind(&mail.subject)
            .bind(mail.is_spam)
            .bind(mail.score)
            .execute(&mut *tx)
            .await
            .context("could not save mail")?;
        }

        tx.commit().await.context("could not commit mails")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    async fn open_store() -> (TempDir, SqliteStateStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let store = SqliteStateStore::connect(path.to_str().unwrap())
            .await
            .unwrap();
        (dir, store)
    }

    fn mail(class: MailClass, uid: u32, fingerprint: &str, folder: &str) -> NewMail {
        NewMail {
            class,
            uid,
            fingerprint: fingerprint.to_string(),
            folder: folder.to_string(),
            subject: format!("mail {uid}"),
            is_spam: None,
            score: None,
        }
    }

    #[tokio::test]
    async fn save_folder_upserts_by_name() {
        let (_dir, store) = open_store().await;

        store.save_folder("INBOX", 123).await.unwrap();
        store.save_folder("Junk", 7).await.unwrap();
        store.save_folder("INBOX", 124).await.unwrap();

        let mut folders = store.all_folders().await.unwrap();
        folders.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(
            folders,
            vec![
                FolderRecord {
                    name: "INBOX".to_string(),
                    uidvalidity: 124,
                },
                FolderRecord {
                    name: "Junk".to_string(),
                    uidvalidity: 7,
                },
            ]
        );
    }

    #[tokio::test]
    async fn mails_in_folder_filters_by_class_and_folder() {
        let (_dir, store) = open_store().await;

        store
            .save_mails(&[
                mail(MailClass::Checked, 1, "a", "INBOX"),
                mail(MailClass::Checked, 2, "b", "Junk"),
                mail(MailClass::LearnedSpam, 3, "c", "INBOX"),
            ])
            .await
            .unwrap();

        let mails = store
            .mails_in_folder(MailClass::Checked, "INBOX")
            .await
            .unwrap();
        assert_eq!(mails.len(), 1);
        assert_eq!(mails[0].uid, 1);
        assert_eq!(mails[0].fingerprint, "a");
        assert_eq!(mails[0].class, MailClass::Checked);
    }

    #[tokio::test]
    async fn find_mail_by_fingerprint_returns_the_saved_row() {
        let (_dir, store) = open_store().await;

        let mut spam = mail(MailClass::Checked, 5, "abc", "INBOX");
        spam.is_spam = Some(true);
        spam.score = Some(11.5);
        store.save_mails(&[spam]).await.unwrap();

        let found = store
            .find_mail_by_fingerprint(MailClass::Checked, "INBOX", "abc")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.uid, 5);
        assert_eq!(found.is_spam, Some(true));
        assert_eq!(found.score, Some(11.5));

        let missing = store
            .find_mail_by_fingerprint(MailClass::LearnedHam, "INBOX", "abc")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn fingerprints_exist_returns_the_known_subset() {
        let (_dir, store) = open_store().await;

        store
            .save_mails(&[
                mail(MailClass::LearnedSpam, 1, "a", "Junk"),
                mail(MailClass::LearnedSpam, 2, "b", "Junk"),
            ])
            .await
            .unwrap();

        let known = store
            .fingerprints_exist(
                MailClass::LearnedSpam,
                &["a".to_string(), "b".to_string(), "z".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(known, ["a".to_string(), "b".to_string()].into());

        let empty = store
            .fingerprints_exist(MailClass::LearnedSpam, &[])
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn update_uid_requires_exactly_one_row() {
        let (_dir, store) = open_store().await;

        let err = store.update_uid(999, 4).await.unwrap_err();
        assert!(
            err.to_string().contains("expected 1 got 0"),
            "unexpected error: {err}"
        );

        store
            .save_mails(&[mail(MailClass::Checked, 1, "a", "INBOX")])
            .await
            .unwrap();
        let saved = store
            .find_mail_by_fingerprint(MailClass::Checked, "INBOX", "a")
            .await
            .unwrap()
            .unwrap();

        store.update_uid(saved.id, 42).await.unwrap();
        let refreshed = store
            .find_mail_by_fingerprint(MailClass::Checked, "INBOX", "a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refreshed.uid, 42);
    }

    #[tokio::test]
    async fn save_mails_rolls_back_the_whole_batch_on_failure() {
        let (_dir, store) = open_store().await;

        // Force the third insert to fail mid-transaction.
        sqlx::query("CREATE UNIQUE INDEX idx_test_unique_fp ON messages (fingerprint)")
            .execute(&store.pool)
            .await
            .unwrap();

        let result = store
            .save_mails(&[
                mail(MailClass::Checked, 1, "a", "INBOX"),
                mail(MailClass::Checked, 2, "b", "INBOX"),
                mail(MailClass::Checked, 3, "a", "INBOX"),
            ])
            .await;
        assert!(result.is_err());

        let mails = store
            .mails_in_folder(MailClass::Checked, "INBOX")
            .await
            .unwrap();
        assert!(mails.is_empty(), "partial batch was persisted: {mails:?}");
    }
}
