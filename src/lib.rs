//! Asynchronous render-job pipeline.
//!
//! This library provides the core of the document-rendering service: an
//! admission API that validates and queues render requests, a tier-weighted
//! at-least-once queue with visibility leasing, a version-guarded job store,
//! and the worker loop that executes renders and publishes artifacts.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod queue;
pub mod routes;
pub mod services;
pub mod store;
pub mod worker;
