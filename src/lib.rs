//! member-sync - Background synchronization of group memberships
//!
//! This crate keeps a local copy of the member lists of upstream groups up to
//! date. Jobs are recorded in a ledger, claimed fairly per user, and each one
//! fetches a group's members in batched pages and applies the difference.

pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod otel;
pub mod sync;
pub mod upstream;
