//! Per-message metadata shared between the pipeline and its modules.

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
};

use ahash::AHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Connection-level facts about the session a message arrived on.
///
/// Absent entirely for locally-injected messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnInfo {
    /// Remote address of the client, when known.
    pub remote_addr: Option<SocketAddr>,
    /// The HELO/EHLO name the client presented.
    pub helo: String,
    /// Whether the session is TLS-protected.
    pub tls: bool,
    /// Protocol name for trace headers (`ESMTP`, `LMTP`, ...).
    pub proto: String,
}

/// Metadata that travels with one message through the pipeline.
///
/// The original-recipient map and the quarantine flag are the only
/// mutable parts; both are written from the serial state-machine calls
/// and may be read concurrently by delivery targets.
#[derive(Debug)]
pub struct MsgMetadata {
    /// Opaque message identifier assigned by the source.
    pub id: String,
    /// The envelope sender exactly as first seen, before any rewriting.
    pub original_from: String,
    /// Session facts, or `None` for locally-injected messages.
    pub conn: Option<ConnInfo>,
    original_rcpts: RwLock<AHashMap<String, String>>,
    quarantine: AtomicBool,
}

impl MsgMetadata {
    /// Creates metadata for a new message transaction.
    pub fn new(id: impl Into<String>, original_from: impl Into<String>, conn: Option<ConnInfo>) -> Self {
        Self {
            id: id.into(),
            original_from: original_from.into(),
            conn,
            original_rcpts: RwLock::new(AHashMap::new()),
            quarantine: AtomicBool::new(false),
        }
    }

    /// Records that `final_rcpt` was produced by rewriting `original`.
    ///
    /// Entries are never overwritten once added. Recording is
    /// transitive: if `original` is itself a rewrite product, the
    /// stored value is the address the chain started from.
    pub fn record_original_rcpt(&self, final_rcpt: &str, original: &str) {
        let mut map = self.original_rcpts.write();
        let original = map.get(original).cloned().unwrap_or_else(|| original.to_owned());
        if final_rcpt == original {
            return;
        }
        map.entry(final_rcpt.to_owned()).or_insert(original);
    }

    /// The address `final_rcpt` was rewritten from, if any rewriting
    /// happened. Falls back to `final_rcpt` itself.
    pub fn original_rcpt(&self, final_rcpt: &str) -> String {
        self.original_rcpts
            .read()
            .get(final_rcpt)
            .cloned()
            .unwrap_or_else(|| final_rcpt.to_owned())
    }

    /// Snapshot of the full rewrite map.
    pub fn original_rcpts(&self) -> AHashMap<String, String> {
        self.original_rcpts.read().clone()
    }

    /// Marks the message quarantined. The flag is never cleared.
    pub fn set_quarantine(&self) {
        self.quarantine.store(true, Ordering::Relaxed);
    }

    /// Whether some check or policy quarantined the message.
    pub fn quarantine(&self) -> bool {
        self.quarantine.load(Ordering::Relaxed)
    }
}
