//! Farm-side task driver for ComfyUI render jobs.
//!
//! Each farm task maps to one [`orchestrator::TaskOrchestrator`]: it
//! picks or adopts a ComfyUI instance, queues the task's chunk of
//! prompts, tracks them over the process log stream and the history API
//! at once, and reports progress, failure, or completion to the
//! [`host::FarmHost`].

pub mod claim;
pub mod completion;
pub mod config;
pub mod host;
pub mod launcher;
pub mod lifecycle;
pub mod orchestrator;
