//! Core protocol types for gRPC-Web.
//!
//! This crate provides the protocol-level pieces that do not depend on any
//! particular HTTP client or schema source.
//!
//! ## Modules
//!
//! - [`error`]: Status codes, status values, and envelope errors
//! - [`codec`]: Compression codec trait and implementations
//! - [`compression`]: Compression encoding negotiation
//! - [`envelope`]: gRPC-Web envelope framing
//! - [`metadata`]: Status extraction from headers and trailer frames

mod codec;
mod compression;
mod envelope;
mod error;
mod metadata;

pub use codec::*;
pub use compression::*;
pub use envelope::*;
pub use error::*;
pub use metadata::*;
