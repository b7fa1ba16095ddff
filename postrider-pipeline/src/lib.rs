//! The message pipeline of the postrider mail server.
//!
//! For each message accepted by an SMTP/Submission/LMTP endpoint, the
//! pipeline decides which checks run, which address rewriters apply,
//! and which delivery targets the message fans out to:
//!
//! - the envelope sender selects a *source block*, then each recipient
//!   independently selects a *recipient block* inside it, so one
//!   transaction may split across several targets;
//! - checks of a phase run concurrently under a shared cancellation
//!   context and their verdicts merge deterministically in declared
//!   order;
//! - recipient rewrites may expand one address into many, with the
//!   original identities preserved for status reporting;
//! - the outermost pipeline synthesizes a DMARC verdict from the
//!   SPF/DKIM results its checks contributed and applies the published
//!   policy;
//! - the whole thing speaks the [`target::DeliveryTarget`] contract
//!   itself, so a pipeline can be nested as another pipeline's target
//!   (`reroute`).

#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod authres;
pub mod check;
pub mod config;
pub mod dmarc;
pub mod modify;
pub mod pipeline;
pub mod routing;
mod runner;
pub mod target;

pub use authres::{AuthResult, ResultValue};
pub use check::{Check, CheckResult, CheckState, EarlyCheck};
pub use config::{ConfigError, PipelineConfig, Registry};
pub use dmarc::{DnsTxtResolver, TxtLookupError, TxtResolver};
pub use modify::{Modifier, ModifierGroup, ModifierState};
pub use pipeline::MsgPipeline;
pub use target::{Delivery, DeliveryTarget, PartialDelivery, StatusCollector};
