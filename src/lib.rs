//! Durable text job queue service.
//!
//! Clients submit UTF-8 text over HTTP; workers count characters under
//! SQLite-backed leases so crashes, restarts, and expired leases never lose
//! or double-complete work. The store is the source of truth; the in-memory
//! queue is only a scheduling hint.

pub mod app_state;
pub mod clock;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
