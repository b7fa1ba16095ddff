//! Check contracts and verdicts.
//!
//! A check validates a message at one or more SMTP-aligned phases
//! (connection, sender, recipient, body) and contributes a
//! [`CheckResult`] per phase. Concrete checks (SPF, DKIM, DNSBL, spam
//! scoring) live outside the pipeline; only this contract is consumed.

use std::sync::Arc;

use async_trait::async_trait;
use postrider_common::{Buffer, ConnInfo, Field, Header, MsgMetadata, SmtpError};
use tokio_util::sync::CancellationToken;

use crate::authres::AuthResult;

/// Verdict contributed by one check at one phase.
///
/// The default value is the empty verdict: accept, no score, no
/// headers, no authentication results.
#[derive(Debug, Clone, Default)]
pub struct CheckResult {
    /// Refuse the message with this reply. The first reject in declared
    /// check order wins; peers of the phase are cancelled.
    pub reject: Option<SmtpError>,

    /// Mark the message quarantined. Non-fatal; OR-combined.
    pub quarantine: bool,

    /// Delta added to the message score. The pipeline compares the
    /// summed score against its configured thresholds after body-phase
    /// checks.
    pub score: i32,

    /// Header fields to prepend to the message.
    pub headers: Vec<Field>,

    /// Authentication results to fold into `Authentication-Results`.
    pub auth_results: Vec<AuthResult>,
}

impl CheckResult {
    /// A verdict that rejects with the given reply.
    pub fn reject(err: SmtpError) -> Self {
        Self {
            reject: Some(err),
            ..Self::default()
        }
    }

    /// A verdict that only adjusts the score.
    pub fn score(score: i32) -> Self {
        Self {
            score,
            ..Self::default()
        }
    }
}

/// A pluggable message validator.
#[async_trait]
pub trait Check: Send + Sync {
    /// Stable check name used in logs and error annotations.
    fn name(&self) -> &str;

    /// Creates the per-message state for one transaction.
    ///
    /// Called lazily on first use within a transaction; the returned
    /// state is closed exactly once when the transaction ends.
    ///
    /// # Errors
    ///
    /// Returns [`SmtpError`] when the check cannot participate in this
    /// transaction; the transaction is then rejected.
    async fn state_for_msg(
        &self,
        ctx: &CancellationToken,
        meta: &Arc<MsgMetadata>,
    ) -> Result<Box<dyn CheckState>, SmtpError>;
}

/// Per-message check state.
///
/// Phase methods default to the empty verdict so checks only implement
/// the phases they care about. States are driven from a single task at
/// a time; they do not need internal synchronization.
#[async_trait]
pub trait CheckState: Send + Sync {
    /// Connection-phase verdict, applied during `start`.
    async fn check_connection(&mut self, _ctx: &CancellationToken) -> CheckResult {
        CheckResult::default()
    }

    /// Sender-phase verdict, applied during `start`.
    async fn check_sender(&mut self, _ctx: &CancellationToken, _from: &str) -> CheckResult {
        CheckResult::default()
    }

    /// Recipient-phase verdict, applied during `add_rcpt`.
    async fn check_rcpt(&mut self, _ctx: &CancellationToken, _to: &str) -> CheckResult {
        CheckResult::default()
    }

    /// Body-phase verdict, applied during `body`.
    async fn check_body(
        &mut self,
        _ctx: &CancellationToken,
        _header: &Header,
        _body: &Arc<dyn Buffer>,
    ) -> CheckResult {
        CheckResult::default()
    }

    /// Releases per-message resources. Called exactly once.
    async fn close(&mut self) -> Result<(), SmtpError> {
        Ok(())
    }
}

/// Optional pre-pipeline connection veto.
///
/// Message sources may consult this before a transaction exists, e.g.
/// to drop blocklisted clients before the banner. The pipeline itself
/// never calls it.
#[async_trait]
pub trait EarlyCheck: Send + Sync {
    /// Rejects the connection outright, before any message state.
    ///
    /// # Errors
    ///
    /// Returns [`SmtpError`] to refuse the connection.
    async fn check_connection_early(
        &self,
        ctx: &CancellationToken,
        conn: &ConnInfo,
    ) -> Result<(), SmtpError>;
}
