//! Photo processing pipeline
//!
//! Turns uploaded photos into tracked jobs, drives each through an external AI
//! provider and resolves it to a terminal state while keeping its batch
//! consistent. Jobs and batches live in PostgreSQL, photos in Cloudflare R2,
//! and upload events arrive on a Redis queue.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;

#[cfg(test)]
pub(crate) mod test_support;
