//! The resolved routing tree.
//!
//! A pipeline routes each message by matching the envelope sender
//! against source blocks, then routes each recipient independently
//! against the chosen block's recipient blocks. The tree is built once
//! by the configuration layer and never mutated.

use std::{fmt, sync::Arc};

use ahash::AHashMap;
use postrider_common::{SmtpError, Table, address};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    check::Check,
    modify::ModifierGroup,
    pipeline::MsgPipeline,
    target::DeliveryTarget,
};

/// One table-driven routing entry: the first table that reports the
/// key as present selects its block.
pub struct TableRoute<B> {
    /// The table to probe.
    pub table: Arc<dyn Table>,
    /// Name of the table, for log lines when a lookup fails.
    pub table_name: String,
    /// The block selected when the table matches.
    pub block: B,
}

impl<B> fmt::Debug for TableRoute<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableRoute")
            .field("table", &self.table_name)
            .finish_non_exhaustive()
    }
}

/// Routing subtree selected by the envelope sender.
pub struct SourceBlock {
    /// Source-scope checks.
    pub checks: Vec<Arc<dyn Check>>,
    /// Source-scope modifiers.
    pub modifiers: ModifierGroup,
    /// What this block does with messages routed here.
    pub action: SourceAction,
}

impl fmt::Debug for SourceBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceBlock")
            .field("checks", &self.checks.len())
            .field("action", &self.action)
            .finish()
    }
}

/// A source block either rejects everything routed to it or routes
/// recipients; never both.
pub enum SourceAction {
    /// Refuse any message routed here with this reply.
    Reject(SmtpError),
    /// Route each recipient independently.
    Route(RcptRouting),
}

impl fmt::Debug for SourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reject(err) => f.debug_tuple("Reject").field(&err.to_string()).finish(),
            Self::Route(routing) => f.debug_tuple("Route").field(routing).finish(),
        }
    }
}

/// Recipient routing within a source block.
pub struct RcptRouting {
    /// Table-driven entries, probed in order before the maps.
    pub lookups: Vec<TableRoute<Arc<RcptBlock>>>,
    /// Full-address and domain keys, post-normalization.
    pub map: AHashMap<String, Arc<RcptBlock>>,
    /// Fallback when nothing else matches.
    pub default: Arc<RcptBlock>,
}

impl fmt::Debug for RcptRouting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RcptRouting")
            .field("lookups", &self.lookups.len())
            .field("keys", &self.map.len())
            .finish_non_exhaustive()
    }
}

/// Routing subtree selected by an envelope recipient.
///
/// The block's modifier group is only ever driven through the
/// recipient and body phases; a sender rewrite configured here is
/// discarded by the orchestrator with a warning.
pub struct RcptBlock {
    /// Recipient-scope checks.
    pub checks: Vec<Arc<dyn Check>>,
    /// Recipient-scope modifiers.
    pub modifiers: ModifierGroup,
    /// How recipients routed here terminate.
    pub action: RcptAction,
}

impl fmt::Debug for RcptBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RcptBlock")
            .field("checks", &self.checks.len())
            .field("action", &self.action)
            .finish()
    }
}

/// Exactly one way for a recipient block to terminate a recipient.
pub enum RcptAction {
    /// Hand the recipient to these delivery targets.
    Deliver(Vec<Arc<dyn DeliveryTarget>>),
    /// Feed the recipient through a nested pipeline.
    Reroute(Arc<MsgPipeline>),
    /// Refuse the recipient with this reply.
    Reject(SmtpError),
}

impl fmt::Debug for RcptAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deliver(targets) => f.debug_tuple("Deliver").field(&targets.len()).finish(),
            Self::Reroute(_) => f.write_str("Reroute"),
            Self::Reject(err) => f.debug_tuple("Reject").field(&err.to_string()).finish(),
        }
    }
}

/// Selects a block for a normalized key: ordered table lookups first
/// (lookup failures are logged and skipped), then the full-address
/// map, then the key's domain, then the default.
///
/// The null sender `""` and `postmaster` carry no domain and skip the
/// domain step.
pub(crate) async fn select_block<'a, B>(
    ctx: &CancellationToken,
    lookups: &'a [TableRoute<B>],
    map: &'a AHashMap<String, B>,
    default: &'a B,
    key: &str,
) -> &'a B {
    for route in lookups {
        match route.table.lookup(ctx, key).await {
            Ok(Some(_)) => return &route.block,
            Ok(None) => {}
            Err(err) => {
                warn!(table = %route.table_name, key, error = %err, "table lookup failed, skipping routing entry");
            }
        }
    }

    if let Some(block) = map.get(key) {
        return block;
    }

    if let Ok((_, domain)) = address::split(key) {
        if let Some(block) = map.get(domain) {
            return block;
        }
    }

    default
}
