//! Delivery-target contracts.
//!
//! A [`DeliveryTarget`] accepts message transactions; a [`Delivery`] is
//! one in-flight transaction on such a target. The pipeline both
//! consumes these traits (for its configured targets) and implements
//! them (so a pipeline can be nested as a target of another pipeline).

use std::sync::Arc;

use async_trait::async_trait;
use postrider_common::{Buffer, Header, MsgMetadata, SmtpError};
use tokio_util::sync::CancellationToken;

/// Something messages can be handed to: a remote queue, a local
/// mailbox store, or a nested pipeline.
#[async_trait]
pub trait DeliveryTarget: Send + Sync {
    /// Stable target name used in logs and error annotations.
    fn name(&self) -> &str;

    /// Begins a message transaction for the given envelope sender.
    ///
    /// # Errors
    ///
    /// Returns [`SmtpError`] when the target cannot accept a
    /// transaction right now.
    async fn start(
        &self,
        ctx: &CancellationToken,
        meta: &Arc<MsgMetadata>,
        mail_from: &str,
    ) -> Result<Box<dyn Delivery>, SmtpError>;
}

/// One in-flight transaction on a delivery target.
///
/// Calls arrive strictly in state-machine order: `add_rcpt` zero or
/// more times, then at most one `body`, then exactly one of `commit`
/// or `abort`. Implementations need not be cancel-safe across calls;
/// the pipeline serializes all calls into one delivery.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Attaches a recipient to the transaction.
    async fn add_rcpt(&mut self, ctx: &CancellationToken, to: &str) -> Result<(), SmtpError>;

    /// Delivers the message payload with one status for all recipients.
    async fn body(
        &mut self,
        ctx: &CancellationToken,
        header: &Header,
        body: Arc<dyn Buffer>,
    ) -> Result<(), SmtpError>;

    /// Discards the transaction.
    async fn abort(&mut self, ctx: &CancellationToken) -> Result<(), SmtpError>;

    /// Finalizes the transaction.
    async fn commit(&mut self, ctx: &CancellationToken) -> Result<(), SmtpError>;

    /// Downcast hook for targets that can report per-recipient status.
    fn as_partial(&mut self) -> Option<&mut dyn PartialDelivery> {
        None
    }
}

/// Per-recipient delivery status, reported through a [`StatusCollector`]
/// instead of a single return value.
#[async_trait]
pub trait PartialDelivery: Send {
    /// Delivers the payload, reporting status per recipient. Recipients
    /// without a reported status are considered failed.
    async fn body_non_atomic(
        &mut self,
        ctx: &CancellationToken,
        sc: &dyn StatusCollector,
        header: &Header,
        body: Arc<dyn Buffer>,
    );
}

/// Sink for per-recipient delivery statuses.
pub trait StatusCollector: Send + Sync {
    /// Publishes the delivery outcome for one recipient.
    fn set_status(&self, rcpt: &str, result: Result<(), SmtpError>);
}
