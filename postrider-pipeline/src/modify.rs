//! Modifier contracts and the modifier group runner.
//!
//! Modifiers rewrite the envelope sender, expand recipients, and edit
//! the message body. A [`ModifierGroup`] drives an ordered list of them
//! with a strict state lifecycle: states are created in declared order,
//! outputs thread into the next modifier's input, and every created
//! state is closed exactly once even when creation or a rewrite fails
//! partway.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use postrider_common::{Buffer, Header, MsgMetadata, SmtpError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A pluggable address or body transformer.
#[async_trait]
pub trait Modifier: Send + Sync {
    /// Stable modifier name used in logs and error annotations.
    fn name(&self) -> &str;

    /// Creates the per-message state for one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`SmtpError`] when the modifier cannot participate; the
    /// transaction is then aborted.
    async fn state_for_msg(
        &self,
        ctx: &CancellationToken,
        meta: &Arc<MsgMetadata>,
    ) -> Result<Box<dyn ModifierState>, SmtpError>;
}

/// Per-message modifier state.
///
/// Methods default to identity transforms so modifiers only implement
/// what they change.
#[async_trait]
pub trait ModifierState: Send + Sync {
    /// Rewrites the envelope sender. Called once per scope, before
    /// (global) or just after (source) source-block selection.
    async fn rewrite_sender(
        &mut self,
        _ctx: &CancellationToken,
        from: &str,
    ) -> Result<String, SmtpError> {
        Ok(from.to_owned())
    }

    /// Rewrites one recipient into zero or more recipients. Returning
    /// multiple addresses expands the recipient; each result is routed
    /// independently.
    async fn rewrite_rcpt(
        &mut self,
        _ctx: &CancellationToken,
        to: &str,
    ) -> Result<Vec<String>, SmtpError> {
        Ok(vec![to.to_owned()])
    }

    /// Edits the message header in place. Called once, after result
    /// headers have been added.
    async fn rewrite_body(
        &mut self,
        _ctx: &CancellationToken,
        _header: &mut Header,
        _body: &Arc<dyn Buffer>,
    ) -> Result<(), SmtpError> {
        Ok(())
    }

    /// Releases per-message resources. Called exactly once.
    async fn close(&mut self) -> Result<(), SmtpError> {
        Ok(())
    }
}

/// An ordered group of modifiers sharing one lifecycle.
#[derive(Clone, Default)]
pub struct ModifierGroup {
    modifiers: Vec<Arc<dyn Modifier>>,
}

impl fmt::Debug for ModifierGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModifierGroup")
            .field("modifiers", &self.modifiers.len())
            .finish()
    }
}

impl ModifierGroup {
    /// Creates a group over the given modifiers, in declared order.
    pub fn new(modifiers: Vec<Arc<dyn Modifier>>) -> Self {
        Self { modifiers }
    }

    /// Whether the group has no modifiers.
    pub fn is_empty(&self) -> bool {
        self.modifiers.is_empty()
    }

    /// Creates states for every modifier, in order.
    ///
    /// # Errors
    ///
    /// If any creation fails, all states created so far are closed and
    /// the error is returned annotated with the failing modifier.
    pub async fn state_for_msg(
        &self,
        ctx: &CancellationToken,
        meta: &Arc<MsgMetadata>,
    ) -> Result<ModifierGroupState, SmtpError> {
        let mut states = Vec::with_capacity(self.modifiers.len());
        for modifier in &self.modifiers {
            match modifier.state_for_msg(ctx, meta).await {
                Ok(state) => states.push(ModSlot {
                    name: modifier.name().to_owned(),
                    state,
                }),
                Err(err) => {
                    let mut partial = ModifierGroupState { states };
                    partial.close().await;
                    return Err(err.with_modifier(modifier.name()));
                }
            }
        }
        Ok(ModifierGroupState { states })
    }
}

struct ModSlot {
    name: String,
    state: Box<dyn ModifierState>,
}

/// Per-message state of a [`ModifierGroup`].
pub struct ModifierGroupState {
    states: Vec<ModSlot>,
}

impl fmt::Debug for ModifierGroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModifierGroupState")
            .field("open_states", &self.states.len())
            .finish()
    }
}

impl ModifierGroupState {
    /// Threads the sender through every modifier in order.
    ///
    /// # Errors
    ///
    /// Propagates the first modifier error, annotated with its name.
    pub async fn rewrite_sender(
        &mut self,
        ctx: &CancellationToken,
        from: &str,
    ) -> Result<String, SmtpError> {
        let mut current = from.to_owned();
        for slot in &mut self.states {
            current = slot
                .state
                .rewrite_sender(ctx, &current)
                .await
                .map_err(|e| e.with_modifier(&slot.name))?;
        }
        Ok(current)
    }

    /// Expands one recipient through every modifier in order.
    ///
    /// Each address emitted by modifier *i* is independently fed to
    /// modifier *i+1*, so expansion composes as a flat-map. The
    /// worklist is explicit to keep stack usage flat under heavy
    /// aliasing.
    ///
    /// # Errors
    ///
    /// Propagates the first modifier error, annotated with its name.
    pub async fn rewrite_rcpt(
        &mut self,
        ctx: &CancellationToken,
        to: &str,
    ) -> Result<Vec<String>, SmtpError> {
        let mut current = vec![to.to_owned()];
        for slot in &mut self.states {
            let mut next = Vec::with_capacity(current.len());
            for addr in &current {
                next.extend(
                    slot.state
                        .rewrite_rcpt(ctx, addr)
                        .await
                        .map_err(|e| e.with_modifier(&slot.name))?,
                );
            }
            current = next;
            if current.is_empty() {
                break;
            }
        }
        Ok(current)
    }

    /// Runs every modifier's body rewrite in order.
    ///
    /// # Errors
    ///
    /// Propagates the first modifier error, annotated with its name.
    pub async fn rewrite_body(
        &mut self,
        ctx: &CancellationToken,
        header: &mut Header,
        body: &Arc<dyn Buffer>,
    ) -> Result<(), SmtpError> {
        for slot in &mut self.states {
            slot.state
                .rewrite_body(ctx, header, body)
                .await
                .map_err(|e| e.with_modifier(&slot.name))?;
        }
        Ok(())
    }

    /// Closes every state exactly once. Close failures are logged, not
    /// surfaced; further calls are no-ops.
    pub async fn close(&mut self) {
        for mut slot in self.states.drain(..) {
            if let Err(err) = slot.state.close().await {
                warn!(modifier = %slot.name, error = %err, "failed to close modifier state");
            }
        }
    }

    /// Number of still-open states.
    pub fn open_states(&self) -> usize {
        self.states.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ahash::AHashMap;
    use postrider_common::EnhancedCode;
    use pretty_assertions::assert_eq;

    use super::*;

    struct AliasModifier {
        name: String,
        rcpt_map: AHashMap<String, Vec<String>>,
        fail_init: bool,
        open: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    impl AliasModifier {
        fn new(name: &str, map: &[(&str, &[&str])]) -> (Arc<Self>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let open = Arc::new(AtomicUsize::new(0));
            let closed = Arc::new(AtomicUsize::new(0));
            let modifier = Arc::new(Self {
                name: name.to_owned(),
                rcpt_map: map
                    .iter()
                    .map(|(k, v)| ((*k).to_owned(), v.iter().map(|s| (*s).to_owned()).collect()))
                    .collect(),
                fail_init: false,
                open: open.clone(),
                closed: closed.clone(),
            });
            (modifier, open, closed)
        }

        fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_owned(),
                rcpt_map: AHashMap::new(),
                fail_init: true,
                open: Arc::new(AtomicUsize::new(0)),
                closed: Arc::new(AtomicUsize::new(0)),
            })
        }
    }

    struct AliasState {
        rcpt_map: AHashMap<String, Vec<String>>,
        open: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Modifier for AliasModifier {
        fn name(&self) -> &str {
            &self.name
        }

        async fn state_for_msg(
            &self,
            _ctx: &CancellationToken,
            _meta: &Arc<MsgMetadata>,
        ) -> Result<Box<dyn ModifierState>, SmtpError> {
            if self.fail_init {
                return Err(SmtpError::new(
                    451,
                    EnhancedCode(4, 3, 0),
                    "modifier unavailable",
                ));
            }
            self.open.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(AliasState {
                rcpt_map: self.rcpt_map.clone(),
                open: self.open.clone(),
                closed: self.closed.clone(),
            }))
        }
    }

    #[async_trait]
    impl ModifierState for AliasState {
        async fn rewrite_rcpt(
            &mut self,
            _ctx: &CancellationToken,
            to: &str,
        ) -> Result<Vec<String>, SmtpError> {
            Ok(self
                .rcpt_map
                .get(to)
                .cloned()
                .unwrap_or_else(|| vec![to.to_owned()]))
        }

        async fn close(&mut self) -> Result<(), SmtpError> {
            self.open.fetch_sub(1, Ordering::SeqCst);
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn meta() -> Arc<MsgMetadata> {
        Arc::new(MsgMetadata::new("test", "s@example.com", None))
    }

    #[tokio::test]
    async fn test_expansion_composes() {
        let (a, ..) = AliasModifier::new("a", &[("x@example.com", &["y@example.com", "z@example.com"])]);
        let (b, ..) = AliasModifier::new("b", &[("y@example.com", &["w@example.com"])]);
        let group = ModifierGroup::new(vec![a, b]);
        let ctx = CancellationToken::new();

        let mut state = group.state_for_msg(&ctx, &meta()).await.unwrap();
        let mut out = state.rewrite_rcpt(&ctx, "x@example.com").await.unwrap();
        out.sort();
        assert_eq!(out, vec!["w@example.com", "z@example.com"]);
        state.close().await;
    }

    #[tokio::test]
    async fn test_untouched_rcpt_passes_through() {
        let (a, ..) = AliasModifier::new("a", &[]);
        let group = ModifierGroup::new(vec![a]);
        let ctx = CancellationToken::new();

        let mut state = group.state_for_msg(&ctx, &meta()).await.unwrap();
        let out = state.rewrite_rcpt(&ctx, "q@example.com").await.unwrap();
        assert_eq!(out, vec!["q@example.com"]);
        state.close().await;
    }

    #[tokio::test]
    async fn test_init_failure_closes_earlier_states() {
        let (a, open, closed) = AliasModifier::new("a", &[]);
        let failing = AliasModifier::failing("b");
        let group = ModifierGroup::new(vec![a, failing]);
        let ctx = CancellationToken::new();

        let err = group.state_for_msg(&ctx, &meta()).await.unwrap_err();
        assert_eq!(err.modifier.as_deref(), Some("b"));
        assert_eq!(open.load(Ordering::SeqCst), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (a, open, closed) = AliasModifier::new("a", &[]);
        let group = ModifierGroup::new(vec![a]);
        let ctx = CancellationToken::new();

        let mut state = group.state_for_msg(&ctx, &meta()).await.unwrap();
        assert_eq!(state.open_states(), 1);
        state.close().await;
        state.close().await;
        assert_eq!(open.load(Ordering::SeqCst), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
