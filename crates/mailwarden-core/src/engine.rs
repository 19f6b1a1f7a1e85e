//! The reconciliation engine: drives each folder through the check or learn
//! pipeline, batching previously unseen mails through the classifier and
//! committing state per batch.

use std::collections::HashSet;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use mailwarden_content::short_subject;

use crate::{
    BatchClassifier, FetchedMail, FolderRecord, ImapConnector, LearnKind, MailClass, NewMail,
    SpamVerdict, StateStore,
};

pub const BATCH_SIZE: usize = 50;
pub const CHECK_CONCURRENCY: usize = 16;
pub const LEARN_CONCURRENCY: usize = 8;

/// Dispositions and switches for one engine run.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub dry_run: bool,
    pub delete_spam: bool,
    pub move_spam: bool,
    pub spam_folder: Option<String>,
    pub append_reports: bool,
    pub report_folder: Option<String>,
    pub delete_learned: bool,
}

impl EngineOptions {
    fn validate(&self) -> Result<()> {
        if self.move_spam && self.delete_spam {
            bail!("MoveSpam and DeleteSpam cannot be used at the same time");
        }
        if self.move_spam && self.spam_folder.as_deref().unwrap_or("").is_empty() {
            bail!("MoveSpam requires a SpamFolder");
        }
        if self.append_reports && self.report_folder.as_deref().unwrap_or("").is_empty() {
            bail!("AppendReports requires a ReportFolder");
        }
        Ok(())
    }
}

pub struct SpamEngine<S, C, I> {
    store: S,
    classifier: C,
    imap: I,
    options: EngineOptions,
}

impl<S, C, I> SpamEngine<S, C, I>
where
    S: StateStore,
    C: BatchClassifier,
    I: ImapConnector,
{
    pub fn new(store: S, classifier: C, imap: I, options: EngineOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            store,
            classifier,
            imap,
            options,
        })
    }

    /// Classifies every previously unseen mail in `folders` and applies the
    /// configured disposition to the spam among them.
    pub async fn check_spam(&mut self, folders: &[String]) -> Result<()> {
        let known_folders = self
            .store
            .all_folders()
            .await
            .context("could not list known folders")?;

        for folder in folders {
            let uidvalidity = self
                .imap
                .select(folder)
                .with_context(|| format!("could not select folder {folder}"))?;

            if !self.options.dry_run {
                if self.options.delete_spam {
                    if let Some(reason) = self
                        .imap
                        .delete_ready()
                        .context("could not check for delete readiness")?
                    {
                        warn!(folder = %folder, reason = %reason, "folder is not ready for mail deletion, skipping");
                        continue;
                    }
                } else if self.options.move_spam {
                    if let Some(reason) = self
                        .imap
                        .move_ready()
                        .context("could not check for move readiness")?
                    {
                        warn!(folder = %folder, reason = %reason, "folder is not ready for mail moving, skipping");
                        continue;
                    }
                }
            }

            let new_uids = self
                .new_mail_uids(folder, MailClass::Checked, &known_folders, uidvalidity)
                .await
                .context("could not determine new mail uids")?;

            if new_uids.is_empty() {
                info!(folder = %folder, "folder contains no new mails");
                continue;
            }

            let batches: Vec<&[u32]> = new_uids.chunks(BATCH_SIZE).collect();
            info!(folder = %folder, newmails = new_uids.len(), batches = batches.len(), "found mails to check");

            let (mut total_ok, mut total_spam) = (0usize, 0usize);
            for batch in batches {
                let start = Instant::now();
                debug!(batchsize = batch.len(), "checking batch");
                let mails = self
                    .imap
                    .fetch_mails(batch)
                    .context("could not fetch mail batch")?;
                debug!(duration = ?start.elapsed(), "fetched mail batch");

                let bodies: Vec<Vec<u8>> = mails.iter().map(|m| m.raw.clone()).collect();
                let results = self.classifier.check_all(bodies, CHECK_CONCURRENCY).await;

                let (mut ok, mut spam) = (Vec::new(), Vec::new());
                let mut verdicts = Vec::with_capacity(mails.len());
                for (mail, result) in mails.iter().zip(results) {
                    let verdict = result.with_context(|| {
                        format!(
                            "could not check mail \"{} ({})\"",
                            short_subject(&mail.subject),
                            mail.uid
                        )
                    })?;
                    debug!(
                        folder = %folder,
                        subject = %short_subject(&mail.subject),
                        is_spam = verdict.is_spam,
                        score = verdict.score,
                        "checked mail"
                    );
                    if verdict.is_spam {
                        spam.push(mail.uid);
                        self.append_report(folder, mail, &verdict)?;
                    } else {
                        ok.push(mail.uid);
                    }
                    verdicts.push(verdict);
                }

                if !spam.is_empty() {
                    self.dispose_spam(folder, &spam)?;
                }

                // Dispositions hit the server before the rows commit; after
                // a crash in between, the batch is re-checked instead of
                // silently skipped.
                let rows: Vec<NewMail> = mails
                    .iter()
                    .zip(&verdicts)
                    .map(|(mail, verdict)| NewMail {
                        class: MailClass::Checked,
                        uid: mail.uid,
                        fingerprint: mail.fingerprint.clone(),
                        folder: folder.clone(),
                        subject: mail.subject.clone(),
                        is_spam: Some(verdict.is_spam),
                        score: Some(verdict.score),
                    })
                    .collect();
                self.store
                    .save_mails(&rows)
                    .await
                    .context("could not save mails")?;

                total_ok += ok.len();
                total_spam += spam.len();
                info!(
                    duration = ?start.elapsed(),
                    batchsize = batch.len(),
                    ok = ok.len(),
                    spam = spam.len(),
                    "checked batch"
                );
            }

            self.store
                .save_folder(folder, uidvalidity)
                .await
                .with_context(|| format!("could not save uidvalidity for {folder}"))?;
            info!(folder = %folder, ok = total_ok, spam = total_spam, "checked folder");
        }

        Ok(())
    }

    /// Feeds every previously unseen mail in `folders` to the classifier as
    /// training material, optionally deleting each batch afterwards.
    pub async fn learn(&mut self, kind: LearnKind, folders: &[String]) -> Result<()> {
        let class = kind.class();
        let known_folders = self
            .store
            .all_folders()
            .await
            .context("could not list known folders")?;

        for folder in folders {
            let uidvalidity = self
                .imap
                .select(folder)
                .with_context(|| format!("could not select folder {folder}"))?;

            let new_uids = self
                .new_mail_uids(folder, class, &known_folders, uidvalidity)
                .await
                .context("could not determine new mail uids")?;

            if new_uids.is_empty() {
                info!(folder = %folder, kind = kind.as_str(), "folder contains no new mails to learn");
                continue;
            }

            if !self.options.dry_run && self.options.delete_learned {
                if let Some(reason) = self
                    .imap
                    .delete_ready()
                    .context("could not check for delete readiness")?
                {
                    warn!(folder = %folder, reason = %reason, "folder is not ready for mail deletion, skipping");
                    continue;
                }
            }

            let batches: Vec<&[u32]> = new_uids.chunks(BATCH_SIZE).collect();
            info!(
                folder = %folder,
                kind = kind.as_str(),
                newmails = new_uids.len(),
                batches = batches.len(),
                "found mails to learn"
            );

            for batch in batches {
                let start = Instant::now();
                debug!(batchsize = batch.len(), "learning batch");
                let mails = self
                    .imap
                    .fetch_mails(batch)
                    .context("could not fetch mail batch")?;

                let bodies: Vec<Vec<u8>> = mails.iter().map(|m| m.raw.clone()).collect();
                let results = self.classifier.learn_all(kind, bodies, LEARN_CONCURRENCY).await;

                for (mail, result) in mails.iter().zip(results) {
                    result.with_context(|| {
                        format!("could not learn mail \"{}\"", short_subject(&mail.subject))
                    })?;
                }

                let rows: Vec<NewMail> = mails
                    .iter()
                    .map(|mail| NewMail {
                        class,
                        uid: mail.uid,
                        fingerprint: mail.fingerprint.clone(),
                        folder: folder.clone(),
                        subject: mail.subject.clone(),
                        is_spam: None,
                        score: None,
                    })
                    .collect();
                self.store
                    .save_mails(&rows)
                    .await
                    .context("could not save mails")?;
                info!(duration = ?start.elapsed(), batchsize = batch.len(), "learned batch");

                if self.options.delete_learned {
                    if self.options.dry_run {
                        info!(folder = %folder, "not deleting learned mails due to dry-run");
                    } else {
                        debug!(batchsize = batch.len(), "deleting learned batch");
                        self.imap
                            .delete(batch)
                            .context("could not delete batch after learning")?;
                        info!(duration = ?start.elapsed(), batchsize = batch.len(), "deleted learned batch");
                    }
                }
            }

            self.store
                .save_folder(folder, uidvalidity)
                .await
                .with_context(|| format!("could not save uidvalidity for {folder}"))?;
            info!(folder = %folder, kind = kind.as_str(), newmails = new_uids.len(), "learned mails");
        }

        Ok(())
    }

    /// Logs out of the message store. The state store closes with its pool.
    pub fn close(mut self) -> Result<()> {
        self.imap.close()
    }

    fn append_report(
        &mut self,
        folder: &str,
        mail: &FetchedMail,
        verdict: &SpamVerdict,
    ) -> Result<()> {
        if !self.options.append_reports {
            return Ok(());
        }
        if self.options.dry_run {
            info!(
                folder = %folder,
                subject = %short_subject(&mail.subject),
                score = verdict.score,
                "not appending report due to dry-run"
            );
            return Ok(());
        }
        let report_folder = match self.options.report_folder.clone() {
            Some(report_folder) => report_folder,
            None => return Ok(()),
        };

        info!(
            folder = %folder,
            subject = %short_subject(&mail.subject),
            score = verdict.score,
            "appending spam report"
        );
        self.imap
            .put(&verdict.report, &report_folder)
            .with_context(|| {
                format!(
                    "could not append report for \"{}\" to {report_folder}",
                    short_subject(&mail.subject)
                )
            })
    }

    fn dispose_spam(&mut self, folder: &str, spam: &[u32]) -> Result<()> {
        if self.options.dry_run {
            info!(folder = %folder, spam = spam.len(), "not moving or deleting spam mails due to dry-run");
            return Ok(());
        }

        if self.options.move_spam {
            let destination = match self.options.spam_folder.clone() {
                Some(destination) => destination,
                None => return Ok(()),
            };
            info!(folder = %folder, spam = spam.len(), destination = %destination, "moving spam mails");
            self.imap
                .move_mails(spam, &destination)
                .context("could not move spam")?;
        } else if self.options.delete_spam {
            info!(folder = %folder, spam = spam.len(), "deleting spam mails");
            self.imap.delete(spam).context("could not delete spam")?;
        }
        Ok(())
    }

    /// Computes the uids in `folder` not yet recorded under `class`.
    ///
    /// An unknown folder yields everything. A known folder with an unchanged
    /// uidvalidity subtracts the recorded uids. A changed uidvalidity means
    /// the server reissued uids, so identity is recovered per mail by
    /// fingerprint and matching rows get their uid refreshed.
    ///
    /// The result is sorted descending so partial runs cover recent mail
    /// first.
    async fn new_mail_uids(
        &mut self,
        folder: &str,
        class: MailClass,
        known_folders: &[FolderRecord],
        uidvalidity: u32,
    ) -> Result<Vec<u32>> {
        let known_folder = known_folders.iter().find(|f| f.name == folder);

        let mut new_uids = self
            .imap
            .list_uids()
            .context("could not list uids in folder")?;
        debug!(folder = %folder, known = known_folder.is_some(), mails = new_uids.len(), "listed all uids in folder");

        match known_folder {
            Some(known) if known.uidvalidity == uidvalidity => {
                debug!(folder = %folder, "uidvalidity unchanged, fast uid scan is possible");
                let known_mails = self
                    .store
                    .mails_in_folder(class, folder)
                    .await
                    .context("could not list known mails")?;
                let seen: HashSet<u32> = known_mails.iter().map(|m| m.uid).collect();
                new_uids.retain(|uid| !seen.contains(uid));
            }
            Some(_) => {
                debug!(folder = %folder, "uidvalidity changed, recovering identity via fingerprints");
                let id_headers = self
                    .imap
                    .fetch_id_headers(&new_uids)
                    .context("could not fetch id headers for folder")?;

                for info in id_headers {
                    let known_mail = self
                        .store
                        .find_mail_by_fingerprint(class, folder, &info.fingerprint)
                        .await
                        .context("could not look up mail by fingerprint")?;

                    if let Some(known_mail) = known_mail {
                        debug!(
                            folder = %folder,
                            subject = %short_subject(&known_mail.subject),
                            "known by fingerprint, updating uid"
                        );
                        self.store
                            .update_uid(known_mail.id, info.uid)
                            .await
                            .context("could not update uid")?;
                        new_uids.retain(|&uid| uid != info.uid);
                    }
                }
            }
            None => {
                debug!(folder = %folder, "previously unknown folder, no diff possible");
            }
        }

        new_uids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(new_uids)
    }
}
