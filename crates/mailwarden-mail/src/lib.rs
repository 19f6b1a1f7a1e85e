//! IMAP session against the message store, with capability-negotiated
//! delete and move strategies.

use std::collections::HashSet;

use anyhow::{Context, Result, bail};
use imap::{ClientBuilder, ConnectionMode, TlsKind};
use tracing::{debug, info};

use mailwarden_content::header_infos;
use mailwarden_core::{FetchedMail, IdHeader, ImapConnector};

type Session = imap::Session<imap::Connection>;

const DELETED_FLAG_REASON: &str = "folder has previous items with delete flag set";

/// How mails get expunged. `UidExpunge` removes exactly the addressed uids;
/// the fallback flags them and issues an untargeted EXPUNGE, which is only
/// safe when nothing else in the folder carries the deleted flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeleteStrategy {
    UidExpunge,
    FlagAndExpunge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveStrategy {
    Native,
    CopyAndDelete,
}

/// One authenticated IMAP session with one selected folder at a time.
pub struct ImapSession {
    session: Session,
    delete_strategy: DeleteStrategy,
    move_strategy: MoveStrategy,
}

impl ImapSession {
    pub fn connect(host: &str, port: u16, user: &str, password: &str) -> Result<Self> {
        let client = ClientBuilder::new(host, port)
            .tls_kind(TlsKind::Native)
            .mode(ConnectionMode::AutoTls)
            .connect()
            .context("could not connect to imap server")?;

        let mut session = client
            .login(user, password)
            .map_err(|e| e.0)
            .context("could not login to imap server")?;
        debug!(server = %host, "logged in to server");

        let capabilities = session
            .capabilities()
            .context("could not query server capabilities")?;

        let delete_strategy = if capabilities.has_str("UIDPLUS") {
            debug!(server = %host, "UIDPLUS supported on server, using UID expunge");
            DeleteStrategy::UidExpunge
        } else {
            info!(server = %host, "UIDPLUS not supported on server, falling back to flag&expunge");
            DeleteStrategy::FlagAndExpunge
        };

        let move_strategy = if capabilities.has_str("MOVE") {
            debug!(server = %host, "MOVE supported on server");
            MoveStrategy::Native
        } else {
            info!(server = %host, "MOVE not supported on server, falling back to copy&delete");
            MoveStrategy::CopyAndDelete
        };

        Ok(Self {
            session,
            delete_strategy,
            move_strategy,
        })
    }
}

impl ImapConnector for ImapSession {
    fn select(&mut self, folder: &str) -> Result<u32> {
        let mailbox = self
            .session
            .select(folder)
            .context("could not select folder")?;
        mailbox
            .uid_validity
            .context("server did not report a uidvalidity for the folder")
    }

    fn list_uids(&mut self) -> Result<Vec<u32>> {
        let uids = self
            .session
            .uid_search("ALL")
            .context("could not list folder")?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    fn fetch_mails(&mut self, uids: &[u32]) -> Result<Vec<FetchedMail>> {
        let fetches = self
            .session
            .uid_fetch(uid_set(uids), "(UID BODY.PEEK[])")
            .context("could not fetch mails")?;

        let mut mails = Vec::new();
        for fetch in fetches.iter() {
            let uid = fetch.uid.context("fetch response carried no uid")?;
            let raw = fetch
                .body()
                .with_context(|| format!("fetch response for uid {uid} carried no body"))?;
            let infos = header_infos(raw)
                .with_context(|| format!("could not parse headers of uid {uid}"))?;
            mails.push(FetchedMail {
                uid,
                subject: infos.subject,
                fingerprint: infos.fingerprint,
                raw: raw.to_vec(),
            });
        }
        Ok(mails)
    }

    fn fetch_id_headers(&mut self, uids: &[u32]) -> Result<Vec<IdHeader>> {
        let fetches = self
            .session
            .uid_fetch(uid_set(uids), "(UID BODY.PEEK[HEADER])")
            .context("could not fetch mail headers")?;

        let mut infos = Vec::new();
        for fetch in fetches.iter() {
            let uid = fetch.uid.context("fetch response carried no uid")?;
            let header = fetch
                .header()
                .with_context(|| format!("fetch response for uid {uid} carried no header"))?;
            let parsed = header_infos(header)
                .with_context(|| format!("could not parse headers of uid {uid}"))?;
            infos.push(IdHeader {
                uid,
                subject: parsed.subject,
                fingerprint: parsed.fingerprint,
            });
        }
        Ok(infos)
    }

    fn put(&mut self, body: &[u8], folder: &str) -> Result<()> {
        self.session
            .append(folder, body)
            .finish()
            .with_context(|| format!("could not append to {folder}"))?;
        Ok(())
    }

    fn delete(&mut self, uids: &[u32]) -> Result<()> {
        let strategy = self.delete_strategy;
        delete_with(strategy, self, uids)
    }

    fn delete_ready(&mut self) -> Result<Option<String>> {
        let strategy = self.delete_strategy;
        delete_ready_with(strategy, self)
    }

    fn move_mails(&mut self, uids: &[u32], folder: &str) -> Result<()> {
        let (move_strategy, delete_strategy) = (self.move_strategy, self.delete_strategy);
        move_with(move_strategy, delete_strategy, self, uids, folder)
    }

    fn move_ready(&mut self) -> Result<Option<String>> {
        let (move_strategy, delete_strategy) = (self.move_strategy, self.delete_strategy);
        move_ready_with(move_strategy, delete_strategy, self)
    }

    fn close(&mut self) -> Result<()> {
        self.session.logout().context("could not logout")
    }
}

/// The mailbox primitives the strategies are built from.
trait MailboxOps {
    fn search_deleted(&mut self) -> Result<Vec<u32>>;
    fn flag_deleted(&mut self, uids: &[u32]) -> Result<()>;
    /// Untargeted EXPUNGE; returns the sequence numbers the server reported
    /// expunged.
    fn expunge(&mut self) -> Result<Vec<u32>>;
    /// UID EXPUNGE on exactly `uids`; returns the expunged uids.
    fn uid_expunge(&mut self, uids: &[u32]) -> Result<Vec<u32>>;
    fn uid_copy(&mut self, uids: &[u32], folder: &str) -> Result<()>;
    fn uid_move(&mut self, uids: &[u32], folder: &str) -> Result<()>;
}

impl MailboxOps for ImapSession {
    fn search_deleted(&mut self) -> Result<Vec<u32>> {
        let uids = self
            .session
            .uid_search("DELETED")
            .context("could not search for deleted mails in folder")?;
        Ok(uids.into_iter().collect())
    }

    fn flag_deleted(&mut self, uids: &[u32]) -> Result<()> {
        self.session
            .uid_store(uid_set(uids), "+FLAGS.SILENT (\\Deleted)")
            .context("could not set deleted flag")?;
        Ok(())
    }

    fn expunge(&mut self) -> Result<Vec<u32>> {
        let deleted = self.session.expunge().context("could not expunge mails")?;
        Ok(deleted.seqs().collect())
    }

    fn uid_expunge(&mut self, uids: &[u32]) -> Result<Vec<u32>> {
        let deleted = self
            .session
            .uid_expunge(uid_set(uids))
            .context("could not expunge mails")?;
        Ok(deleted.uids().collect())
    }

    fn uid_copy(&mut self, uids: &[u32], folder: &str) -> Result<()> {
        self.session
            .uid_copy(uid_set(uids), folder)
            .context("could not copy mails")?;
        Ok(())
    }

    fn uid_move(&mut self, uids: &[u32], folder: &str) -> Result<()> {
        self.session
            .uid_mv(uid_set(uids), folder)
            .context("could not move mails")?;
        Ok(())
    }
}

fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn delete_ready_with(
    strategy: DeleteStrategy,
    ops: &mut impl MailboxOps,
) -> Result<Option<String>> {
    match strategy {
        // UID EXPUNGE only touches the addressed uids.
        DeleteStrategy::UidExpunge => Ok(None),
        // An untargeted EXPUNGE removes every flagged mail in the folder,
        // so pre-existing flags make it unsafe.
        DeleteStrategy::FlagAndExpunge => {
            let flagged = ops.search_deleted()?;
            if flagged.is_empty() {
                Ok(None)
            } else {
                Ok(Some(DELETED_FLAG_REASON.to_string()))
            }
        }
    }
}

fn delete_with(strategy: DeleteStrategy, ops: &mut impl MailboxOps, uids: &[u32]) -> Result<()> {
    match strategy {
        DeleteStrategy::UidExpunge => {
            ops.flag_deleted(uids)
                .context("could not flag items as deleted")?;
            let expunged = ops.uid_expunge(uids)?;
            if expunged.len() != uids.len() {
                bail!(
                    "unexpected number of expunges, expected {} got {}",
                    uids.len(),
                    expunged.len()
                );
            }

            let requested: HashSet<u32> = uids.iter().copied().collect();
            let removed: HashSet<u32> = expunged.iter().copied().collect();
            if requested != removed {
                bail!("expunged uids do not match the requested uids");
            }
        }
        DeleteStrategy::FlagAndExpunge => {
            if let Some(reason) = delete_ready_with(strategy, ops)
                .context("could not check for delete readiness")?
            {
                bail!("folder is not ready for delete: {reason}");
            }

            ops.flag_deleted(uids)
                .context("could not set deleted flag")?;
            let expunged = ops.expunge()?;
            if expunged.len() != uids.len() {
                bail!(
                    "unexpected number of expunges, expected {} got {}",
                    uids.len(),
                    expunged.len()
                );
            }
        }
    }
    Ok(())
}

fn move_ready_with(
    move_strategy: MoveStrategy,
    delete_strategy: DeleteStrategy,
    ops: &mut impl MailboxOps,
) -> Result<Option<String>> {
    match move_strategy {
        // MOVE is atomic on the server.
        MoveStrategy::Native => Ok(None),
        MoveStrategy::CopyAndDelete => delete_ready_with(delete_strategy, ops),
    }
}

fn move_with(
    move_strategy: MoveStrategy,
    delete_strategy: DeleteStrategy,
    ops: &mut impl MailboxOps,
    uids: &[u32],
    folder: &str,
) -> Result<()> {
    match move_strategy {
        MoveStrategy::Native => ops.uid_move(uids, folder),
        MoveStrategy::CopyAndDelete => {
            if let Some(reason) = move_ready_with(move_strategy, delete_strategy, ops)
                .context("could not check for delete readiness to move")?
            {
                bail!("folder is not ready for delete, cannot move: {reason}");
            }

            ops.uid_copy(uids, folder)
                .context("could not copy mails")?;
            delete_with(delete_strategy, ops, uids).context("could not delete copied mails")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum OpsCall {
        SearchDeleted,
        FlagDeleted(Vec<u32>),
        Expunge,
        UidExpunge(Vec<u32>),
        UidCopy(Vec<u32>, String),
        UidMove(Vec<u32>, String),
    }

    #[derive(Default)]
    struct FakeOps {
        deleted_flagged: Vec<u32>,
        expunge_reports: Vec<u32>,
        calls: Vec<OpsCall>,
    }

    impl MailboxOps for FakeOps {
        fn search_deleted(&mut self) -> Result<Vec<u32>> {
            self.calls.push(OpsCall::SearchDeleted);
            Ok(self.deleted_flagged.clone())
        }

        fn flag_deleted(&mut self, uids: &[u32]) -> Result<()> {
            self.calls.push(OpsCall::FlagDeleted(uids.to_vec()));
            Ok(())
        }

        fn expunge(&mut self) -> Result<Vec<u32>> {
            self.calls.push(OpsCall::Expunge);
            Ok(self.expunge_reports.clone())
        }

        fn uid_expunge(&mut self, uids: &[u32]) -> Result<Vec<u32>> {
            self.calls.push(OpsCall::UidExpunge(uids.to_vec()));
            Ok(self.expunge_reports.clone())
        }

        fn uid_copy(&mut self, uids: &[u32], folder: &str) -> Result<()> {
            self.calls
                .push(OpsCall::UidCopy(uids.to_vec(), folder.to_string()));
            Ok(())
        }

        fn uid_move(&mut self, uids: &[u32], folder: &str) -> Result<()> {
            self.calls
                .push(OpsCall::UidMove(uids.to_vec(), folder.to_string()));
            Ok(())
        }
    }

    #[test]
    fn uid_expunge_delete_is_always_ready() {
        let mut ops = FakeOps::default();
        let reason = delete_ready_with(DeleteStrategy::UidExpunge, &mut ops).unwrap();
        assert_eq!(reason, None);
        assert!(ops.calls.is_empty());
    }

    #[test]
    fn uid_expunge_delete_flags_and_expunges_the_uids() {
        let mut ops = FakeOps {
            expunge_reports: vec![1, 2, 3],
            ..FakeOps::default()
        };
        delete_with(DeleteStrategy::UidExpunge, &mut ops, &[1, 2, 3]).unwrap();
        assert_eq!(
            ops.calls,
            vec![
                OpsCall::FlagDeleted(vec![1, 2, 3]),
                OpsCall::UidExpunge(vec![1, 2, 3]),
            ]
        );
    }

    #[test]
    fn uid_expunge_delete_rejects_a_diverging_expunge_set() {
        let mut ops = FakeOps {
            // Same cardinality, different membership.
            expunge_reports: vec![1, 2, 4],
            ..FakeOps::default()
        };
        let err = delete_with(DeleteStrategy::UidExpunge, &mut ops, &[1, 2, 3]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "expunged uids do not match the requested uids"
        );
    }

    #[test]
    fn uid_expunge_delete_rejects_an_expunge_count_mismatch() {
        let mut ops = FakeOps {
            expunge_reports: vec![1, 2],
            ..FakeOps::default()
        };
        let err = delete_with(DeleteStrategy::UidExpunge, &mut ops, &[1, 2, 3]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "unexpected number of expunges, expected 3 got 2"
        );
    }

    #[test]
    fn flag_and_expunge_is_ready_without_flagged_mails() {
        let mut ops = FakeOps::default();
        let reason = delete_ready_with(DeleteStrategy::FlagAndExpunge, &mut ops).unwrap();
        assert_eq!(reason, None);
        assert_eq!(ops.calls, vec![OpsCall::SearchDeleted]);
    }

    #[test]
    fn flag_and_expunge_is_not_ready_with_flagged_mails() {
        let mut ops = FakeOps {
            deleted_flagged: vec![1],
            ..FakeOps::default()
        };
        let reason = delete_ready_with(DeleteStrategy::FlagAndExpunge, &mut ops).unwrap();
        assert_eq!(reason, Some(DELETED_FLAG_REASON.to_string()));
    }

    #[test]
    fn flag_and_expunge_delete_flags_and_expunges() {
        let mut ops = FakeOps {
            expunge_reports: vec![1, 2, 3],
            ..FakeOps::default()
        };
        delete_with(DeleteStrategy::FlagAndExpunge, &mut ops, &[1, 2, 3]).unwrap();
        assert_eq!(
            ops.calls,
            vec![
                OpsCall::SearchDeleted,
                OpsCall::FlagDeleted(vec![1, 2, 3]),
                OpsCall::Expunge,
            ]
        );
    }

    #[test]
    fn flag_and_expunge_delete_refuses_an_unready_folder() {
        let mut ops = FakeOps {
            deleted_flagged: vec![1],
            ..FakeOps::default()
        };
        let err = delete_with(DeleteStrategy::FlagAndExpunge, &mut ops, &[1, 2, 3]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "folder is not ready for delete: folder has previous items with delete flag set"
        );
        assert_eq!(ops.calls, vec![OpsCall::SearchDeleted]);
    }

    #[test]
    fn flag_and_expunge_delete_rejects_an_expunge_count_mismatch() {
        let mut ops = FakeOps {
            expunge_reports: vec![1, 2],
            ..FakeOps::default()
        };
        let err = delete_with(DeleteStrategy::FlagAndExpunge, &mut ops, &[1, 2, 3]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "unexpected number of expunges, expected 3 got 2"
        );
    }

    #[test]
    fn native_move_is_always_ready() {
        let mut ops = FakeOps::default();
        let reason = move_ready_with(
            MoveStrategy::Native,
            DeleteStrategy::FlagAndExpunge,
            &mut ops,
        )
        .unwrap();
        assert_eq!(reason, None);
        assert!(ops.calls.is_empty());
    }

    #[test]
    fn native_move_issues_a_single_uid_move() {
        let mut ops = FakeOps::default();
        move_with(
            MoveStrategy::Native,
            DeleteStrategy::UidExpunge,
            &mut ops,
            &[1, 2, 3],
            "dest",
        )
        .unwrap();
        assert_eq!(
            ops.calls,
            vec![OpsCall::UidMove(vec![1, 2, 3], "dest".to_string())]
        );
    }

    #[test]
    fn copy_and_delete_move_readiness_delegates_to_delete() {
        let mut ops = FakeOps {
            deleted_flagged: vec![1],
            ..FakeOps::default()
        };
        let reason = move_ready_with(
            MoveStrategy::CopyAndDelete,
            DeleteStrategy::FlagAndExpunge,
            &mut ops,
        )
        .unwrap();
        assert_eq!(reason, Some(DELETED_FLAG_REASON.to_string()));
    }

    #[test]
    fn copy_and_delete_move_copies_then_deletes() {
        let mut ops = FakeOps {
            expunge_reports: vec![1, 2, 3],
            ..FakeOps::default()
        };
        move_with(
            MoveStrategy::CopyAndDelete,
            DeleteStrategy::FlagAndExpunge,
            &mut ops,
            &[1, 2, 3],
            "dest",
        )
        .unwrap();
        assert_eq!(
            ops.calls,
            vec![
                OpsCall::SearchDeleted,
                OpsCall::UidCopy(vec![1, 2, 3], "dest".to_string()),
                OpsCall::SearchDeleted,
                OpsCall::FlagDeleted(vec![1, 2, 3]),
                OpsCall::Expunge,
            ]
        );
    }

    #[test]
    fn copy_and_delete_move_refuses_an_unready_folder() {
        let mut ops = FakeOps {
            deleted_flagged: vec![1],
            ..FakeOps::default()
        };
        let err = move_with(
            MoveStrategy::CopyAndDelete,
            DeleteStrategy::FlagAndExpunge,
            &mut ops,
            &[1, 2, 3],
            "dest",
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "folder is not ready for delete, cannot move: folder has previous items with delete flag set"
        );
    }

    #[test]
    fn uid_sets_are_comma_joined() {
        assert_eq!(uid_set(&[1]), "1");
        assert_eq!(uid_set(&[3, 1, 2]), "3,1,2");
    }
}
