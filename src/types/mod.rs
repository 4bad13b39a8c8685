//! Common types: upstream API payloads and store entity rows.

/// Typed FPL API payloads (only the fields the service reads)
pub mod api;
/// Store entity rows and domain enums
pub mod domain;
