//! ComfyUI REST client library for farm tasks.
//!
//! Provides the HTTP API wrapper and its [`api::WorkerApi`] seam, typed
//! history entries, the chunk prompt queue, the history poll channel,
//! and the server readiness wait.

pub mod api;
pub mod history;
pub mod poller;
pub mod queue;
pub mod readiness;
