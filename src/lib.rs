//! RSS Tabs - A tabbed RSS/Atom reader
//!
//! This crate fetches and normalizes feeds on demand and keeps each feed in a
//! tab whose state survives restarts through a local key-value store.

pub mod config;
pub mod db;
pub mod ingest;
pub mod model;
pub mod routes;
pub mod session;
