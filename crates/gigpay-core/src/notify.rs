use async_trait::async_trait;
use tracing::info;

use crate::error::EscrowError;
use crate::types::UserId;

/// Fire-and-forget notification capability.
///
/// The engine calls this after an operation's commit point; delivery
/// failures are logged by the engine and never abort the committed
/// operation. Implementations are injected explicitly rather than reached
/// through globals.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user: &UserId, subject: &str, body: &str) -> Result<(), EscrowError>;
}

/// Default notifier: structured log lines only. Suitable for tests and for
/// deployments where delivery is handled by an out-of-process consumer.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user: &UserId, subject: &str, body: &str) -> Result<(), EscrowError> {
        info!(user = %user, subject, body, "notification");
        Ok(())
    }
}
