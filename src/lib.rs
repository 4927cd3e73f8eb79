//! Booking pages for independent practitioners: weekly availability rules,
//! date overrides, bookable slots, and a request/accept booking flow, kept in
//! memory and persisted through a write-ahead log.

pub mod auth;
pub mod calendar;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod protocol;
pub mod reaper;
pub mod wal;
pub mod wire;
