//! Transaction port used by the run loops.
//!
//! A run loop hands its body to [`TransactionManager::execute`] as a boxed
//! future. The outer `Result` reports whether the transaction itself could run;
//! the inner one is the body's own outcome.

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

use crate::actor::ActorRunResult;
use crate::core::processor::ProcessingError;

/// Body executed inside a transaction.
pub type TxBody<'a> =
    Pin<Box<dyn Future<Output = Result<ActorRunResult, ProcessingError>> + Send + 'a>>;

/// Failures of the transaction machinery, as opposed to the body.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// The body did not finish within the timeout.
    #[error("transaction timed out after {0:?}")]
    Timeout(Duration),

    /// A transaction could not be started or committed.
    #[error("transaction unavailable: {0}")]
    Unavailable(String),
}

/// Port running bodies transactionally.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Run `body` in a transaction bounded by `timeout`.
    ///
    /// With `join_if_possible` the body joins an enclosing transaction instead of
    /// opening a new one.
    async fn execute(
        &self,
        timeout: Duration,
        join_if_possible: bool,
        body: TxBody<'_>,
    ) -> Result<Result<ActorRunResult, ProcessingError>, TransactionError>;
}

/// Result of [`run_in_transaction`].
#[derive(Debug)]
pub enum TxOutcome {
    /// The body ran and committed.
    Completed(ActorRunResult),
    /// The body returned an error. Managers with rollback undo its writes;
    /// [`LocalTransactionManager`] keeps them, so callers must not assume
    /// that nothing was persisted.
    Failed(ProcessingError),
    /// The transaction itself failed; nothing is known about the body.
    Unavailable(TransactionError),
}

/// Run a body in a fresh transaction and flatten the result.
pub async fn run_in_transaction(
    transactions: &dyn TransactionManager,
    timeout: Duration,
    body: TxBody<'_>,
) -> TxOutcome {
    match transactions.execute(timeout, false, body).await {
        Ok(Ok(result)) => TxOutcome::Completed(result),
        Ok(Err(e)) => TxOutcome::Failed(e),
        Err(e) => TxOutcome::Unavailable(e),
    }
}

/// Transaction manager for stores without transactions.
///
/// Only the timeout is enforced; writes made before a failure stay visible.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalTransactionManager;

impl LocalTransactionManager {
    /// Create the manager.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransactionManager for LocalTransactionManager {
    async fn execute(
        &self,
        timeout: Duration,
        _join_if_possible: bool,
        body: TxBody<'_>,
    ) -> Result<Result<ActorRunResult, ProcessingError>, TransactionError> {
        tokio::time::timeout(timeout, body)
            .await
            .map_err(|_| TransactionError::Timeout(timeout))
    }
}
