//! Spam classifier backends and the bounded-concurrency batch pool.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::Semaphore;

use mailwarden_core::{BatchClassifier, LearnKind, SpamVerdict};

pub mod rspamd;
pub mod spamassassin;

pub use rspamd::Rspamd;
pub use spamassassin::SpamAssassin;

/// A single-message classifier. Both backends implement this; the pool
/// provides the batched variants on top.
#[async_trait]
pub trait SpamClassifier: Send + Sync {
    async fn check(&self, raw: &[u8]) -> Result<SpamVerdict>;
    async fn learn(&self, kind: LearnKind, raw: &[u8]) -> Result<()>;
}

/// Fans a batch of mails out over a bounded number of workers, retrying
/// each failing item once. Results are index-aligned with the input.
pub struct ClassifierPool {
    classifier: Arc<dyn SpamClassifier>,
}

impl ClassifierPool {
    pub fn new(classifier: Arc<dyn SpamClassifier>) -> Self {
        Self { classifier }
    }
}

#[async_trait]
impl BatchClassifier for ClassifierPool {
    async fn check_all(
        &self,
        mails: Vec<Vec<u8>>,
        concurrency: usize,
    ) -> Vec<Result<SpamVerdict>> {
        let permits = Arc::new(Semaphore::new(concurrency));
        let mut handles = Vec::with_capacity(mails.len());
        for raw in mails {
            // Admission before launch: at most `concurrency` workers are
            // alive and launches happen in input order. The semaphore is
            // never closed, so acquisition cannot fail.
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .expect("pool semaphore closed");
            let classifier = self.classifier.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                match classifier.check(&raw).await {
                    Ok(verdict) => Ok(verdict),
                    // One retry per mail; the second outcome stands.
                    Err(_) => classifier.check(&raw).await,
                }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(err) => Err(anyhow!("classifier worker died: {err}")),
            });
        }
        results
    }

    async fn learn_all(
        &self,
        kind: LearnKind,
        mails: Vec<Vec<u8>>,
        concurrency: usize,
    ) -> Vec<Result<()>> {
        let permits = Arc::new(Semaphore::new(concurrency));
        let mut handles = Vec::with_capacity(mails.len());
        for raw in mails {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .expect("pool semaphore closed");
            let classifier = self.classifier.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                match classifier.learn(kind, &raw).await {
                    Ok(()) => Ok(()),
                    Err(_) => classifier.learn(kind, &raw).await,
                }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(err) => Err(anyhow!("classifier worker died: {err}")),
            });
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    /// Scripted per-mail outcomes keyed by the first body byte; an empty or
    /// missing script means every call succeeds.
    #[derive(Default)]
    struct ScriptedClassifier {
        outcomes: Mutex<HashMap<u8, VecDeque<bool>>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedClassifier {
        fn with_script(script: impl IntoIterator<Item = (u8, Vec<bool>)>) -> Self {
            Self {
                outcomes: Mutex::new(
                    script
                        .into_iter()
                        .map(|(key, outcomes)| (key, outcomes.into()))
                        .collect(),
                ),
                ..Self::default()
            }
        }

        async fn run_one(&self, raw: &[u8]) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            self.outcomes
                .lock()
                .unwrap()
                .get_mut(&raw[0])
                .and_then(|script| script.pop_front())
                .unwrap_or(true)
        }
    }

    #[async_trait]
    impl SpamClassifier for ScriptedClassifier {
        async fn check(&self, raw: &[u8]) -> Result<SpamVerdict> {
            if self.run_one(raw).await {
                Ok(SpamVerdict {
                    is_spam: false,
                    score: 0.0,
                    report: raw.to_vec(),
                })
            } else {
                Err(anyhow!("scripted failure"))
            }
        }

        async fn learn(&self, _kind: LearnKind, raw: &[u8]) -> Result<()> {
            if self.run_one(raw).await {
                Ok(())
            } else {
                Err(anyhow!("scripted failure"))
            }
        }
    }

    #[tokio::test]
    async fn check_all_retries_each_failing_mail_once() {
        let classifier = Arc::new(ScriptedClassifier::with_script([
            (1, vec![false, false]),
            (2, vec![false, true]),
        ]));
        let pool = ClassifierPool::new(classifier.clone());

        let results = pool
            .check_all(vec![vec![0], vec![1], vec![2]], 3)
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().report, vec![0]);
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap().report, vec![2]);
        // 1 + 2 + 2 calls: one clean pass, two retries.
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn check_all_bounds_parallelism() {
        let classifier = Arc::new(ScriptedClassifier {
            delay: Duration::from_millis(20),
            ..ScriptedClassifier::default()
        });
        let pool = ClassifierPool::new(classifier.clone());

        let mails: Vec<Vec<u8>> = (0..12u8).map(|i| vec![i]).collect();
        let results = pool.check_all(mails, 3).await;

        assert_eq!(results.len(), 12);
        assert!(results.iter().all(|r| r.is_ok()));
        let max_active = classifier.max_active.load(Ordering::SeqCst);
        assert!(
            max_active <= 3,
            "parallelism bound exceeded: {max_active} workers were active"
        );
    }

    #[tokio::test]
    async fn check_all_handles_an_empty_batch() {
        let pool = ClassifierPool::new(Arc::new(ScriptedClassifier::default()));
        assert!(pool.check_all(Vec::new(), 4).await.is_empty());
    }

    #[tokio::test]
    async fn learn_all_retries_each_failing_mail_once() {
        let classifier = Arc::new(ScriptedClassifier::with_script([
            (1, vec![false, false]),
            (2, vec![false, true]),
        ]));
        let pool = ClassifierPool::new(classifier.clone());

        let results = pool
            .learn_all(LearnKind::Spam, vec![vec![0], vec![1], vec![2]], 3)
            .await;

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 5);
    }
}
