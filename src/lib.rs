//! Versioned object metadata engine for an S3-style gateway.
//!
//! Object, multipart, freezer and bucket metadata live in a transactional
//! [`store::MetaStore`]; blob bytes live in [`backend::BlobCluster`]s. Blobs
//! that lose their last reference go through the garbage collection ledger,
//! and cooled objects are moved from the fast pool to the capacity pool by the
//! migration engine.

pub mod backend;
pub mod cache;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod lock;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;
