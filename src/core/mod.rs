//! Core modules for keelson's document store.
//!
//! Shared primitives live here: errors, SQL schemas, the connection broker,
//! the store handle and its injectable collaborators, and the payload tree
//! every subsystem operates on.

pub mod broker;
pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod hash;
pub mod payload;
pub mod schemas;
pub mod store;
pub mod time;
pub mod validate;
pub mod version;
