//! Core data model of the metadata engine.
//!
//! These entities are owned by the metadata store; blob clusters only hold the
//! bytes they point at. Every type serializes with `serde` so it can travel
//! through the read-through cache and the key-value backend.

pub mod bucket;
pub mod freezer;
pub mod gc;
pub mod multipart;
pub mod object;
pub mod version;
