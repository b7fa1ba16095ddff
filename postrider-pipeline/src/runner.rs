//! The check runner.
//!
//! Drives every check of a phase concurrently under a shared
//! cancellation context, then merges verdicts deterministically in
//! declared order. Check states are created lazily on first use and
//! tracked for exactly-once close at transaction end.

use std::{fmt, sync::Arc};

use futures_util::stream::{FuturesUnordered, StreamExt};
use postrider_common::{Buffer, Field, Header, MsgMetadata, SmtpError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    authres::AuthResult,
    check::{Check, CheckResult, CheckState},
};

/// Which state-machine call a phase run corresponds to.
pub(crate) enum CheckPhase<'a> {
    Connection,
    Sender(&'a str),
    Rcpt(&'a str),
    Body(&'a Header, &'a Arc<dyn Buffer>),
}

impl CheckPhase<'_> {
    const fn name(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Sender(_) => "sender",
            Self::Rcpt(_) => "rcpt",
            Self::Body(..) => "body",
        }
    }
}

struct Slot {
    check: Arc<dyn Check>,
    state: Option<Box<dyn CheckState>>,
}

/// Per-transaction check scheduler and verdict accumulator.
///
/// One runner serves all scopes of a transaction; scores, headers, and
/// authentication results accumulate across `run_phase` calls.
pub(crate) struct CheckRunner {
    meta: Arc<MsgMetadata>,
    slots: Vec<Slot>,
    score: i32,
    headers: Vec<Field>,
    auth_results: Vec<AuthResult>,
    states_closed: bool,
}

impl fmt::Debug for CheckRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckRunner")
            .field("states", &self.slots.len())
            .field("score", &self.score)
            .finish_non_exhaustive()
    }
}

impl CheckRunner {
    pub(crate) fn new(meta: Arc<MsgMetadata>) -> Self {
        Self {
            meta,
            slots: Vec::new(),
            score: 0,
            headers: Vec::new(),
            auth_results: Vec::new(),
            states_closed: false,
        }
    }

    /// Runs one phase of the given checks concurrently and merges the
    /// verdicts in declared order.
    ///
    /// A reject from any check cancels the phase context observed by
    /// its peers; the runner still waits for every task before
    /// returning. The reject that surfaces is the first one in
    /// *declared* order, annotated with the check's name.
    pub(crate) async fn run_phase(
        &mut self,
        ctx: &CancellationToken,
        checks: &[Arc<dyn Check>],
        phase: CheckPhase<'_>,
    ) -> Result<(), SmtpError> {
        if checks.is_empty() {
            return Ok(());
        }

        let slot_indices = self.ensure_states(ctx, checks).await?;
        let phase_ctx = ctx.child_token();

        let mut running = FuturesUnordered::new();
        for (order, &slot_idx) in slot_indices.iter().enumerate() {
            trace!(
                msg_id = %self.meta.id,
                check = self.slots[slot_idx].check.name(),
                phase = phase.name(),
                "scheduling check task"
            );
            let mut state = self.slots[slot_idx]
                .state
                .take()
                .expect("check state used by two phase tasks at once");
            let token = phase_ctx.clone();
            let phase = &phase;
            running.push(async move {
                let result = tokio::select! {
                    biased;
                    () = token.cancelled() => CheckResult::default(),
                    result = Self::dispatch(&mut *state, &token, phase) => result,
                };
                (order, state, result)
            });
        }

        let mut results: Vec<Option<CheckResult>> = Vec::new();
        results.resize_with(slot_indices.len(), || None);
        while let Some((order, state, result)) = running.next().await {
            trace!(
                msg_id = %self.meta.id,
                check = self.slots[slot_indices[order]].check.name(),
                phase = phase.name(),
                rejecting = result.reject.is_some(),
                "check task finished"
            );
            if result.reject.is_some() {
                phase_ctx.cancel();
            }
            self.slots[slot_indices[order]].state = Some(state);
            results[order] = Some(result);
        }
        drop(running);

        let mut reject = None;
        for (order, result) in results.into_iter().enumerate() {
            let Some(result) = result else { continue };
            let check_name = self.slots[slot_indices[order]].check.name();
            if result.quarantine {
                debug!(msg_id = %self.meta.id, check = check_name, "check quarantined the message");
                self.meta.set_quarantine();
            }
            self.score += result.score;
            self.headers.extend(result.headers);
            for auth_result in result.auth_results {
                if !self.auth_results.contains(&auth_result) {
                    self.auth_results.push(auth_result);
                }
            }
            if reject.is_none() {
                if let Some(err) = result.reject {
                    debug!(
                        msg_id = %self.meta.id,
                        check = check_name,
                        phase = phase.name(),
                        reply = %err,
                        "check rejected the message"
                    );
                    reject = Some(err.with_check(check_name));
                }
            }
        }

        reject.map_or(Ok(()), Err)
    }

    /// Lazily creates states for checks not seen before in this
    /// transaction and returns slot indices in declared order, with
    /// duplicate checks collapsed to a single run.
    async fn ensure_states(
        &mut self,
        ctx: &CancellationToken,
        checks: &[Arc<dyn Check>],
    ) -> Result<Vec<usize>, SmtpError> {
        let mut indices = Vec::with_capacity(checks.len());
        for check in checks {
            let idx = match self.slots.iter().position(|s| Arc::ptr_eq(&s.check, check)) {
                Some(idx) => idx,
                None => {
                    let state = check
                        .state_for_msg(ctx, &self.meta)
                        .await
                        .map_err(|e| e.with_check(check.name()))?;
                    self.slots.push(Slot {
                        check: Arc::clone(check),
                        state: Some(state),
                    });
                    self.slots.len() - 1
                }
            };
            if !indices.contains(&idx) {
                indices.push(idx);
            }
        }
        Ok(indices)
    }

    async fn dispatch(
        state: &mut dyn CheckState,
        ctx: &CancellationToken,
        phase: &CheckPhase<'_>,
    ) -> CheckResult {
        match phase {
            CheckPhase::Connection => state.check_connection(ctx).await,
            CheckPhase::Sender(from) => state.check_sender(ctx, from).await,
            CheckPhase::Rcpt(to) => state.check_rcpt(ctx, to).await,
            CheckPhase::Body(header, body) => state.check_body(ctx, header, body).await,
        }
    }

    /// The summed score across all phases so far.
    pub(crate) const fn score(&self) -> i32 {
        self.score
    }

    /// Accumulated header fields, in declared order.
    pub(crate) fn headers(&self) -> &[Field] {
        &self.headers
    }

    /// Accumulated authentication results, in declared order.
    pub(crate) fn auth_results(&self) -> &[AuthResult] {
        &self.auth_results
    }

    /// Puts a result at the front of the authentication-result list,
    /// ahead of everything the checks contributed.
    pub(crate) fn prepend_auth_result(&mut self, result: AuthResult) {
        self.auth_results.insert(0, result);
    }

    /// Closes every created state exactly once. Close failures are
    /// logged, not surfaced; further calls are no-ops.
    pub(crate) async fn close_states(&mut self) {
        if self.states_closed {
            return;
        }
        self.states_closed = true;
        for slot in &mut self.slots {
            if let Some(mut state) = slot.state.take() {
                if let Err(err) = state.close().await {
                    warn!(check = slot.check.name(), error = %err, "failed to close check state");
                }
            }
        }
    }

    /// Number of still-open check states.
    pub(crate) fn open_states(&self) -> usize {
        self.slots.iter().filter(|s| s.state.is_some()).count()
    }
}
