//! Message catalog and DBC loader
//!
//! This module contains the catalog interface consumed by the analyzer, the
//! in-memory signal database, and the DBC conversion layer.

pub mod database;
pub mod dbc;

// Re-export key types for convenience
pub use database::{
    DatabaseStats, MessageCatalog, MessageDefinition, MultiplexerInfo, SignalDatabase,
    SignalDefinition, ValueType,
};
