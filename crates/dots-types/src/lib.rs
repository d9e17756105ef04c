//! Shared record model for the dots entity pipeline.
//!
//! A dot is a tree-shaped record (id, parent id, name, value). This crate
//! holds the plain data types that flow between application code, the
//! read-side providers and the write-side consumers in `dots-db`. It does
//! no I/O.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe wrapper for dot identifiers
//! - [`structs`] -- The dot record and its enriched view
//! - [`hierarchy`] -- Derivation of depth, child counts and routes

pub mod hierarchy;
pub mod ids;
pub mod structs;

// Re-export all public types at crate root for convenience.
pub use hierarchy::{HierarchyError, derive_meta};
pub use ids::DotId;
pub use structs::{Dot, DotMeta, MetaDot, RequestChannelClosed, RequestDot};
