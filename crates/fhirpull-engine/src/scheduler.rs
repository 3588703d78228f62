//! Concurrency budgets and cooperative cancellation.
//!
//! The scheduler owns one semaphore per named budget and the run-wide
//! cancellation token. Components acquire a permit before suspending on
//! I/O, so cancellation is observed at well-defined points: a cancelled
//! acquire returns [`EngineError::Cancelled`] instead of a permit, and
//! long loops call [`Scheduler::checkpoint`] between iterations.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};

/// Named concurrency budgets, all overridable.
#[derive(Debug, Clone)]
pub struct Budgets {
    /// Concurrent bulk file downloads.
    pub bulk_download: usize,
    /// Patients in flight during a crawl.
    pub crawl_patients: usize,
    /// Resource-type queries in flight per patient. This one is enforced
    /// per patient, not globally; the crawler builds a semaphore of this
    /// size for each patient task.
    pub crawl_types: usize,
    /// Hydration attachment fetches; kept small so note servers are not
    /// overwhelmed.
    pub attachments: usize,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            bulk_download: 5,
            crawl_patients: 8,
            crawl_types: 4,
            attachments: 4,
        }
    }
}

/// Which shared budget an acquire draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    BulkDownload,
    CrawlPatient,
    Attachment,
}

/// Shared scheduler handle. Cloning shares the budgets and the token.
#[derive(Clone)]
pub struct Scheduler {
    budgets: Budgets,
    cancel: CancellationToken,
    bulk_download: Arc<Semaphore>,
    crawl_patients: Arc<Semaphore>,
    attachments: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(budgets: Budgets) -> Self {
        Self {
            cancel: CancellationToken::new(),
            bulk_download: Arc::new(Semaphore::new(budgets.bulk_download.max(1))),
            crawl_patients: Arc::new(Semaphore::new(budgets.crawl_patients.max(1))),
            attachments: Arc::new(Semaphore::new(budgets.attachments.max(1))),
            budgets,
        }
    }

    pub fn budgets(&self) -> &Budgets {
        &self.budgets
    }

    /// Request cooperative cancellation of the whole run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A token that is cancelled when the run is; used by task groups to
    /// stop siblings when one fails fatally.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Error out if cancellation was requested. Call between I/O
    /// operations in long loops.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Acquire a permit from the named budget, or fail if the run is
    /// cancelled while waiting.
    pub async fn acquire(&self, budget: Budget) -> Result<OwnedSemaphorePermit> {
        let semaphore = match budget {
            Budget::BulkDownload => &self.bulk_download,
            Budget::CrawlPatient => &self.crawl_patients,
            Budget::Attachment => &self.attachments,
        };
        self.acquire_from(semaphore).await
    }

    /// Acquire from a caller-owned semaphore (such as a per-patient
    /// fan-out limit), still observing cancellation.
    pub async fn acquire_from(&self, semaphore: &Arc<Semaphore>) -> Result<OwnedSemaphorePermit> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            permit = semaphore.clone().acquire_owned() => {
                permit.map_err(|_| EngineError::Cancelled)
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(Budgets::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_respects_budget() {
        let scheduler = Scheduler::new(Budgets {
            bulk_download: 2,
            ..Budgets::default()
        });
        let _a = scheduler.acquire(Budget::BulkDownload).await.unwrap();
        let _b = scheduler.acquire(Budget::BulkDownload).await.unwrap();

        // third acquire would block; verify it is pending, then freed
        let pending = scheduler.acquire(Budget::BulkDownload);
        tokio::pin!(pending);
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), &mut pending)
                .await
                .is_err()
        );
        drop(_a);
        assert!(pending.await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_unblocks_waiters() {
        let scheduler = Scheduler::new(Budgets {
            crawl_patients: 1,
            ..Budgets::default()
        });
        let held = scheduler.acquire(Budget::CrawlPatient).await.unwrap();

        let waiter = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.acquire(Budget::CrawlPatient).await })
        };
        scheduler.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(EngineError::Cancelled)));
        drop(held);
    }

    #[tokio::test]
    async fn test_acquire_from_local_semaphore() {
        let scheduler = Scheduler::default();
        let local = Arc::new(Semaphore::new(1));
        let held = scheduler.acquire_from(&local).await.unwrap();

        scheduler.cancel();
        let result = scheduler.acquire_from(&local).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
        drop(held);
    }

    #[tokio::test]
    async fn test_checkpoint() {
        let scheduler = Scheduler::default();
        assert!(scheduler.checkpoint().is_ok());
        scheduler.cancel();
        assert!(matches!(scheduler.checkpoint(), Err(EngineError::Cancelled)));
        assert!(scheduler.is_cancelled());
    }
}
