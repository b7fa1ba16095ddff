//! The pipeline orchestrator.
//!
//! [`MsgPipeline`] implements the delivery state machine on top of the
//! routing tree, check runner, and modifier groups: it selects a source
//! block per message, routes every recipient independently (possibly
//! fanning one SMTP transaction out into several delivery targets),
//! applies DMARC and result headers, and finally commits or aborts all
//! targets. A pipeline is itself a [`DeliveryTarget`], which is what
//! makes `reroute` nesting possible.

use std::{
    fmt,
    fmt::Write as _,
    ptr,
    sync::Arc,
};

use ahash::AHashMap;
use async_trait::async_trait;
use chrono::Utc;
use postrider_common::{Buffer, EnhancedCode, Field, Header, MsgMetadata, SmtpError, address};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    authres,
    check::Check,
    config::{ConfigError, PipelineConfig, Registry, build_inner},
    dmarc::{self, TxtResolver},
    modify::{ModifierGroup, ModifierGroupState},
    routing::{RcptAction, RcptBlock, SourceAction, SourceBlock, TableRoute, select_block},
    runner::{CheckPhase, CheckRunner},
    target::{Delivery, DeliveryTarget, PartialDelivery, StatusCollector},
};

/// A fully-built message pipeline. Cheap to clone; the routing tree is
/// immutable and shared.
#[derive(Clone)]
pub struct MsgPipeline {
    pub(crate) inner: Arc<PipelineInner>,
}

impl fmt::Debug for MsgPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgPipeline")
            .field("hostname", &self.inner.hostname)
            .field("first_pipeline", &self.inner.first_pipeline)
            .field("dmarc", &self.inner.dmarc)
            .finish_non_exhaustive()
    }
}

pub(crate) struct PipelineInner {
    pub(crate) hostname: String,
    pub(crate) first_pipeline: bool,
    pub(crate) dmarc: bool,
    pub(crate) quarantine_score: Option<i32>,
    pub(crate) reject_score: Option<i32>,
    pub(crate) checks: Vec<Arc<dyn Check>>,
    pub(crate) modifiers: ModifierGroup,
    pub(crate) source_lookups: Vec<TableRoute<Arc<SourceBlock>>>,
    pub(crate) source_map: AHashMap<String, Arc<SourceBlock>>,
    pub(crate) default_source: Arc<SourceBlock>,
    pub(crate) resolver: Option<Arc<dyn TxtResolver>>,
}

impl MsgPipeline {
    /// Builds the outermost pipeline from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for any invalid or unresolvable piece of
    /// the configuration.
    pub fn from_config(registry: &Registry, config: &PipelineConfig) -> Result<Self, ConfigError> {
        build_inner(registry, config, true, None, None).map(Self::from_inner)
    }

    /// Like [`Self::from_config`] but with an explicit DMARC resolver,
    /// mainly for tests and custom DNS setups.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for any invalid or unresolvable piece of
    /// the configuration.
    pub fn from_config_with_resolver(
        registry: &Registry,
        config: &PipelineConfig,
        resolver: Arc<dyn TxtResolver>,
    ) -> Result<Self, ConfigError> {
        build_inner(registry, config, true, None, Some(resolver)).map(Self::from_inner)
    }

    pub(crate) fn from_inner(inner: PipelineInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }
}

#[async_trait]
impl DeliveryTarget for MsgPipeline {
    fn name(&self) -> &str {
        "pipeline"
    }

    async fn start(
        &self,
        ctx: &CancellationToken,
        meta: &Arc<MsgMetadata>,
        mail_from: &str,
    ) -> Result<Box<dyn Delivery>, SmtpError> {
        let mut delivery = PipelineDelivery::new(Arc::clone(&self.inner), Arc::clone(meta));
        match delivery.run_start(ctx, mail_from).await {
            Ok(()) => Ok(Box::new(delivery)),
            Err(err) => {
                // No delivery object reaches the caller, so nobody will
                // abort us: release states before surfacing the error.
                delivery.close_states().await;
                Err(err)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryPhase {
    Rcpt,
    Body,
    Done,
}

struct RcptBinding {
    block: Arc<RcptBlock>,
    mods: ModifierGroupState,
}

struct TargetDelivery {
    target: Arc<dyn DeliveryTarget>,
    /// Nested-pipeline errors are forwarded verbatim, so the innermost
    /// annotation is the one the client sees.
    pass_through: bool,
    delivery: Box<dyn Delivery>,
    /// Original (pre-rewrite) recipients attached to this delivery,
    /// for per-recipient status reporting.
    original_rcpts: Vec<String>,
}

/// One target hand-off a recipient expansion resolved to, staged until
/// the whole expansion has routed cleanly.
struct PlannedRcpt {
    target: Arc<dyn DeliveryTarget>,
    pass_through: bool,
    rcpt: String,
    original: String,
}

struct PipelineDelivery {
    p: Arc<PipelineInner>,
    meta: Arc<MsgMetadata>,
    checks: CheckRunner,
    global_mods: Option<ModifierGroupState>,
    source_block: Option<Arc<SourceBlock>>,
    source_mods: Option<ModifierGroupState>,
    rcpt_blocks: Vec<RcptBinding>,
    deliveries: Vec<TargetDelivery>,
    effective_from: String,
    phase: DeliveryPhase,
    states_closed: bool,
}

fn malformed_sender(err: address::AddressError) -> SmtpError {
    SmtpError::new(
        501,
        EnhancedCode(5, 1, 7),
        "unable to parse the sender address",
    )
    .with_source(err)
}

fn malformed_rcpt(addr: &str, err: address::AddressError) -> SmtpError {
    SmtpError::new(
        553,
        EnhancedCode(5, 1, 2),
        "unable to parse the recipient address",
    )
    .with_source(err)
    .with_effective_rcpt(addr)
}

impl PipelineDelivery {
    fn new(p: Arc<PipelineInner>, meta: Arc<MsgMetadata>) -> Self {
        Self {
            p,
            meta: Arc::clone(&meta),
            checks: CheckRunner::new(meta),
            global_mods: None,
            source_block: None,
            source_mods: None,
            rcpt_blocks: Vec::new(),
            deliveries: Vec::new(),
            effective_from: String::new(),
            phase: DeliveryPhase::Rcpt,
            states_closed: false,
        }
    }

    async fn run_start(&mut self, ctx: &CancellationToken, mail_from: &str) -> Result<(), SmtpError> {
        let from = address::for_lookup(mail_from).map_err(malformed_sender)?;
        debug!(msg_id = %self.meta.id, from = %from, "starting message transaction");

        let p = Arc::clone(&self.p);
        self.checks
            .run_phase(ctx, &p.checks, CheckPhase::Connection)
            .await?;
        self.checks
            .run_phase(ctx, &p.checks, CheckPhase::Sender(&from))
            .await?;

        let mut global_mods = self.p.modifiers.state_for_msg(ctx, &self.meta).await?;
        let from = global_mods.rewrite_sender(ctx, &from).await?;
        let from = address::for_lookup(&from).map_err(malformed_sender)?;
        self.global_mods = Some(global_mods);

        let source = Arc::clone(
            select_block(
                ctx,
                &p.source_lookups,
                &p.source_map,
                &p.default_source,
                &from,
            )
            .await,
        );
        debug!(msg_id = %self.meta.id, from = %from, block = ?source, "selected source block");
        if let SourceAction::Reject(err) = &source.action {
            return Err(err.clone());
        }

        self.checks
            .run_phase(ctx, &source.checks, CheckPhase::Connection)
            .await?;
        self.checks
            .run_phase(ctx, &source.checks, CheckPhase::Sender(&from))
            .await?;

        let mut source_mods = source.modifiers.state_for_msg(ctx, &self.meta).await?;
        let from = source_mods.rewrite_sender(ctx, &from).await?;
        let from = address::for_lookup(&from).map_err(malformed_sender)?;
        self.source_mods = Some(source_mods);

        self.source_block = Some(source);
        self.effective_from = from;
        Ok(())
    }

    async fn run_add_rcpt(&mut self, ctx: &CancellationToken, to: &str) -> Result<(), SmtpError> {
        let original = address::for_lookup(to).map_err(|e| malformed_rcpt(to, e))?;
        let p = Arc::clone(&self.p);
        let source = Arc::clone(self.source_block.as_ref().expect("recipient added before start"));

        self.checks
            .run_phase(ctx, &p.checks, CheckPhase::Rcpt(&original))
            .await
            .map_err(|e| e.with_effective_rcpt(&original))?;
        self.checks
            .run_phase(ctx, &source.checks, CheckPhase::Rcpt(&original))
            .await
            .map_err(|e| e.with_effective_rcpt(&original))?;

        let expanded = self
            .global_mods
            .as_mut()
            .expect("modifier states missing after start")
            .rewrite_rcpt(ctx, &original)
            .await
            .map_err(|e| e.with_effective_rcpt(&original))?;
        let mut rcpts = Vec::with_capacity(expanded.len());
        for addr in &expanded {
            rcpts.extend(
                self.source_mods
                    .as_mut()
                    .expect("modifier states missing after start")
                    .rewrite_rcpt(ctx, addr)
                    .await
                    .map_err(|e| e.with_effective_rcpt(addr))?,
            );
        }

        // One client AddRcpt must not leave partial deliveries behind:
        // every expanded recipient is routed, checked, and rewritten
        // before the first target sees any of them.
        let mut plan = Vec::new();
        for rcpt in &rcpts {
            self.plan_rcpt(ctx, rcpt, &original, &mut plan).await?;
        }
        self.execute_plan(ctx, plan).await
    }

    /// Routes one (already globally- and source-rewritten) recipient
    /// through a recipient block and records the target deliveries it
    /// expands into, without touching any target yet.
    async fn plan_rcpt(
        &mut self,
        ctx: &CancellationToken,
        rcpt: &str,
        original: &str,
        plan: &mut Vec<PlannedRcpt>,
    ) -> Result<(), SmtpError> {
        let rcpt = address::for_lookup(rcpt).map_err(|e| malformed_rcpt(rcpt, e))?;
        let source = Arc::clone(self.source_block.as_ref().expect("recipient routed before start"));
        let SourceAction::Route(routing) = &source.action else {
            unreachable!("rejecting source block survived start");
        };

        let block = Arc::clone(
            select_block(ctx, &routing.lookups, &routing.map, &routing.default, &rcpt).await,
        );
        debug!(msg_id = %self.meta.id, rcpt = %rcpt, block = ?block, "selected recipient block");
        if let RcptAction::Reject(err) = &block.action {
            return Err(err.clone().with_effective_rcpt(&rcpt));
        }

        self.checks
            .run_phase(ctx, &block.checks, CheckPhase::Rcpt(&rcpt))
            .await
            .map_err(|e| e.with_effective_rcpt(&rcpt))?;

        let binding = self
            .rcpt_binding(ctx, &block)
            .await
            .map_err(|e| e.with_effective_rcpt(&rcpt))?;
        let finals = self.rcpt_blocks[binding]
            .mods
            .rewrite_rcpt(ctx, &rcpt)
            .await
            .map_err(|e| e.with_effective_rcpt(&rcpt))?;

        for final_addr in &finals {
            let final_rcpt =
                address::for_lookup(final_addr).map_err(|e| malformed_rcpt(final_addr, e))?;
            self.meta.record_original_rcpt(&final_rcpt, original);
            match &block.action {
                RcptAction::Deliver(targets) => {
                    for target in targets {
                        plan.push(PlannedRcpt {
                            target: Arc::clone(target),
                            pass_through: false,
                            rcpt: final_rcpt.clone(),
                            original: original.to_owned(),
                        });
                    }
                }
                RcptAction::Reroute(pipeline) => {
                    plan.push(PlannedRcpt {
                        target: Arc::clone(pipeline) as Arc<dyn DeliveryTarget>,
                        pass_through: true,
                        rcpt: final_rcpt.clone(),
                        original: original.to_owned(),
                    });
                }
                RcptAction::Reject(_) => unreachable!("rejecting block reached delivery"),
            }
        }
        Ok(())
    }

    /// Hands a fully-planned recipient expansion to its targets. On a
    /// target failure, deliveries started by this call are aborted and
    /// discarded so the failed AddRcpt leaves them untouched.
    async fn execute_plan(
        &mut self,
        ctx: &CancellationToken,
        plan: Vec<PlannedRcpt>,
    ) -> Result<(), SmtpError> {
        let preexisting = self.deliveries.len();
        for planned in &plan {
            if let Err(err) = self
                .deliver_to(
                    ctx,
                    Arc::clone(&planned.target),
                    planned.pass_through,
                    &planned.rcpt,
                    &planned.original,
                )
                .await
            {
                self.rollback_new_deliveries(ctx, preexisting).await;
                return Err(err);
            }
        }
        Ok(())
    }

    async fn rollback_new_deliveries(&mut self, ctx: &CancellationToken, keep: usize) {
        // A delivery started by the failing AddRcpt call holds only
        // recipients from that call and can be dropped whole.
        for mut entry in self.deliveries.split_off(keep) {
            trace!(
                msg_id = %self.meta.id,
                target = entry.target.name(),
                "rolling back delivery started by failed recipient expansion"
            );
            if let Err(err) = entry.delivery.abort(ctx).await {
                warn!(
                    msg_id = %self.meta.id,
                    target = entry.target.name(),
                    error = %err,
                    "failed to abort delivery during recipient rollback"
                );
            }
        }
    }

    /// Creates (or reuses) the per-block modifier state.
    ///
    /// A recipient block's modifiers never get to rewrite the sender:
    /// the result is computed once at state creation, discarded, and
    /// logged when it differs.
    async fn rcpt_binding(
        &mut self,
        ctx: &CancellationToken,
        block: &Arc<RcptBlock>,
    ) -> Result<usize, SmtpError> {
        if let Some(idx) = self
            .rcpt_blocks
            .iter()
            .position(|b| Arc::ptr_eq(&b.block, block))
        {
            return Ok(idx);
        }

        let mut mods = block.modifiers.state_for_msg(ctx, &self.meta).await?;
        match mods.rewrite_sender(ctx, &self.effective_from).await {
            Ok(rewritten) if rewritten != self.effective_from => {
                warn!(
                    msg_id = %self.meta.id,
                    "recipient-block modifier attempted to rewrite the sender; ignored"
                );
            }
            Ok(_) => {}
            Err(err) => {
                warn!(
                    msg_id = %self.meta.id,
                    error = %err,
                    "recipient-block modifier failed to rewrite the sender; ignored"
                );
            }
        }

        self.rcpt_blocks.push(RcptBinding {
            block: Arc::clone(block),
            mods,
        });
        Ok(self.rcpt_blocks.len() - 1)
    }

    /// Lazily starts the delivery for `target` and attaches the
    /// recipient to it.
    async fn deliver_to(
        &mut self,
        ctx: &CancellationToken,
        target: Arc<dyn DeliveryTarget>,
        pass_through: bool,
        rcpt: &str,
        original: &str,
    ) -> Result<(), SmtpError> {
        let idx = match self
            .deliveries
            .iter()
            .position(|d| ptr::addr_eq(Arc::as_ptr(&d.target), Arc::as_ptr(&target)))
        {
            Some(idx) => idx,
            None => {
                let delivery = target
                    .start(ctx, &self.meta, &self.effective_from)
                    .await
                    .map_err(|e| {
                        if pass_through {
                            e
                        } else {
                            e.with_effective_rcpt(rcpt)
                        }
                    })?;
                debug!(
                    msg_id = %self.meta.id,
                    target = target.name(),
                    from = %self.effective_from,
                    "started delivery"
                );
                self.deliveries.push(TargetDelivery {
                    target,
                    pass_through,
                    delivery,
                    original_rcpts: Vec::new(),
                });
                self.deliveries.len() - 1
            }
        };

        let entry = &mut self.deliveries[idx];
        entry.delivery.add_rcpt(ctx, rcpt).await.map_err(|e| {
            if entry.pass_through {
                e
            } else {
                e.with_effective_rcpt(rcpt)
            }
        })?;
        if !entry.original_rcpts.iter().any(|r| r == original) {
            entry.original_rcpts.push(original.to_owned());
        }
        Ok(())
    }

    /// Body-phase checks, policy decisions, and header assembly shared
    /// by `body` and `body_non_atomic`. Returns the header to hand to
    /// the targets.
    async fn run_body(
        &mut self,
        ctx: &CancellationToken,
        header: &Header,
        body: &Arc<dyn Buffer>,
    ) -> Result<Header, SmtpError> {
        let p = Arc::clone(&self.p);
        let source = Arc::clone(self.source_block.as_ref().expect("body before start"));

        self.checks
            .run_phase(ctx, &p.checks, CheckPhase::Body(header, body))
            .await?;
        self.checks
            .run_phase(ctx, &source.checks, CheckPhase::Body(header, body))
            .await?;
        let used_blocks: Vec<Arc<RcptBlock>> = self
            .rcpt_blocks
            .iter()
            .map(|b| Arc::clone(&b.block))
            .collect();
        for block in &used_blocks {
            self.checks
                .run_phase(ctx, &block.checks, CheckPhase::Body(header, body))
                .await?;
        }

        if let Some(threshold) = p.reject_score {
            if self.checks.score() >= threshold {
                return Err(SmtpError::new(
                    550,
                    EnhancedCode(5, 7, 1),
                    format!("message score {} is over the reject threshold", self.checks.score()),
                ));
            }
        }
        if let Some(threshold) = p.quarantine_score {
            if self.checks.score() >= threshold {
                debug!(
                    msg_id = %self.meta.id,
                    score = self.checks.score(),
                    "message score over the quarantine threshold"
                );
                self.meta.set_quarantine();
            }
        }

        let mut header = header.clone();
        if p.first_pipeline {
            header.prepend(self.received_field());
        }

        if p.dmarc {
            if let Some(resolver) = &p.resolver {
                let eval =
                    dmarc::evaluate(ctx, resolver.as_ref(), &header, self.checks.auth_results())
                        .await;
                debug!(msg_id = %self.meta.id, verdict = %eval.value, "DMARC evaluated");
                if eval.quarantine {
                    self.meta.set_quarantine();
                }
                self.checks.prepend_auth_result(eval.auth_result);
                if let Some(err) = eval.reject {
                    return Err(err);
                }
            }
        }

        for field in self.checks.headers().iter().rev() {
            header.prepend(field.clone());
        }
        if !self.checks.auth_results().is_empty() {
            header.prepend(authres::assemble(&p.hostname, self.checks.auth_results()));
        }

        self.global_mods
            .as_mut()
            .expect("modifier states missing after start")
            .rewrite_body(ctx, &mut header, body)
            .await?;
        self.source_mods
            .as_mut()
            .expect("modifier states missing after start")
            .rewrite_body(ctx, &mut header, body)
            .await?;
        for binding in &mut self.rcpt_blocks {
            binding.mods.rewrite_body(ctx, &mut header, body).await?;
        }

        Ok(header)
    }

    fn received_field(&self) -> Field {
        let mut value = String::new();
        if let Some(conn) = &self.meta.conn {
            value.push_str("from ");
            value.push_str(&conn.helo);
            if let Some(addr) = conn.remote_addr {
                let _ = write!(value, " ([{}])", addr.ip());
            }
            value.push(' ');
        }
        let proto = self.meta.conn.as_ref().map_or("ESMTP", |c| c.proto.as_str());
        let _ = write!(
            value,
            "by {} (postrider) with {} id {}; {}",
            self.p.hostname,
            proto,
            self.meta.id,
            Utc::now().to_rfc2822()
        );
        Field::new("Received", value)
    }

    fn set_status_all(&self, sc: &dyn StatusCollector, err: &SmtpError) {
        for entry in &self.deliveries {
            for original in &entry.original_rcpts {
                sc.set_status(original, Err(err.clone()));
            }
        }
    }

    async fn close_states(&mut self) {
        if self.states_closed {
            return;
        }
        self.states_closed = true;
        self.checks.close_states().await;
        if let Some(mut mods) = self.global_mods.take() {
            mods.close().await;
        }
        if let Some(mut mods) = self.source_mods.take() {
            mods.close().await;
        }
        for binding in &mut self.rcpt_blocks {
            binding.mods.close().await;
        }
    }

    fn finalize(&mut self) {
        assert!(
            self.phase != DeliveryPhase::Done,
            "message transaction finalized twice"
        );
        self.phase = DeliveryPhase::Done;
    }
}

#[async_trait]
impl Delivery for PipelineDelivery {
    async fn add_rcpt(&mut self, ctx: &CancellationToken, to: &str) -> Result<(), SmtpError> {
        assert!(
            self.phase == DeliveryPhase::Rcpt,
            "recipient added after the body was handled"
        );
        self.run_add_rcpt(ctx, to).await
    }

    async fn body(
        &mut self,
        ctx: &CancellationToken,
        header: &Header,
        body: Arc<dyn Buffer>,
    ) -> Result<(), SmtpError> {
        assert!(self.phase == DeliveryPhase::Rcpt, "body handled twice");
        self.phase = DeliveryPhase::Body;

        let final_header = self.run_body(ctx, header, &body).await?;
        for entry in &mut self.deliveries {
            entry
                .delivery
                .body(ctx, &final_header, Arc::clone(&body))
                .await?;
        }
        Ok(())
    }

    async fn abort(&mut self, ctx: &CancellationToken) -> Result<(), SmtpError> {
        self.finalize();
        self.close_states().await;
        let mut last = Ok(());
        for entry in &mut self.deliveries {
            if let Err(err) = entry.delivery.abort(ctx).await {
                warn!(
                    msg_id = %self.meta.id,
                    target = entry.target.name(),
                    error = %err,
                    "failed to abort delivery"
                );
                last = Err(err);
            }
        }
        last
    }

    async fn commit(&mut self, ctx: &CancellationToken) -> Result<(), SmtpError> {
        self.finalize();
        self.close_states().await;
        for entry in &mut self.deliveries {
            entry.delivery.commit(ctx).await?;
        }
        Ok(())
    }

    fn as_partial(&mut self) -> Option<&mut dyn PartialDelivery> {
        Some(self)
    }
}

#[async_trait]
impl PartialDelivery for PipelineDelivery {
    async fn body_non_atomic(
        &mut self,
        ctx: &CancellationToken,
        sc: &dyn StatusCollector,
        header: &Header,
        body: Arc<dyn Buffer>,
    ) {
        assert!(self.phase == DeliveryPhase::Rcpt, "body handled twice");
        self.phase = DeliveryPhase::Body;

        let final_header = match self.run_body(ctx, header, &body).await {
            Ok(header) => header,
            Err(err) => {
                self.set_status_all(sc, &err);
                return;
            }
        };

        let meta = Arc::clone(&self.meta);
        for entry in &mut self.deliveries {
            if let Some(partial) = entry.delivery.as_partial() {
                let translator = StatusTranslator {
                    meta: Arc::clone(&meta),
                    inner: sc,
                };
                partial
                    .body_non_atomic(ctx, &translator, &final_header, Arc::clone(&body))
                    .await;
            } else {
                let result = entry
                    .delivery
                    .body(ctx, &final_header, Arc::clone(&body))
                    .await;
                for original in &entry.original_rcpts {
                    sc.set_status(original, result.clone());
                }
            }
        }
    }
}

/// Translates reported recipients back through the original-recipient
/// map before publishing, so status always names the address the
/// client actually sent.
struct StatusTranslator<'a> {
    meta: Arc<MsgMetadata>,
    inner: &'a dyn StatusCollector,
}

impl StatusCollector for StatusTranslator<'_> {
    fn set_status(&self, rcpt: &str, result: Result<(), SmtpError>) {
        let original = self.meta.original_rcpt(rcpt);
        self.inner.set_status(&original, result);
    }
}
