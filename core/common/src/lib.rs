//! Common utilities and types shared across catalogsync modules.
//!
//! This module provides the error taxonomy and the identifier types that
//! every other crate speaks in: entity scopes, source and destination ids,
//! natural keys and watermarks.

pub mod error;
pub mod types;

pub use error::{Error, Result, SyncError};
pub use types::{DestinationId, EntityScope, NaturalKey, SourceId, Watermark, WatermarkKind};
