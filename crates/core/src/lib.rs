//! Domain logic for bridging render-farm tasks to ComfyUI workers.
//!
//! Everything in this crate is free of HTTP and host-plugin concerns:
//! task identity and roles, seed mutation, port arbitration, log-stream
//! pattern matching, workflow validation, launch arguments, and the
//! chunk progress state machine that reconciles the two completion
//! channels.

pub mod error;
pub mod launch;
pub mod log_events;
pub mod ports;
pub mod progress;
pub mod roles;
pub mod seed;
pub mod types;
pub mod workflow;
