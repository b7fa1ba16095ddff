//! Shared foundation types for the postrider mail pipeline.
//!
//! This crate carries everything both the pipeline core and external
//! modules (checks, modifiers, delivery targets) need to agree on:
//! envelope-address normalization, SMTP reply errors, per-message
//! metadata, the header field model, message buffers, and string tables.

#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod address;
pub mod buffer;
pub mod header;
pub mod meta;
pub mod status;
pub mod table;

pub use buffer::{Buffer, MemoryBuffer};
pub use header::{Field, Header};
pub use meta::{ConnInfo, MsgMetadata};
pub use status::{EnhancedCode, SmtpError};
pub use table::{MapTable, Table, TableError};
