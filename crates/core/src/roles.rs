//! Topology role flags of a farm task.
//!
//! A plain batch task has no flags set. Worker and distributed tasks run
//! their own isolated instance so a master coordinator can dispatch work
//! to them; `force_new` only asks for isolation.

/// Role flags read from the task's plugin info.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleFlags {
    pub worker: bool,
    pub distributed: bool,
    pub force_new: bool,
}

impl RoleFlags {
    pub fn new(worker: bool, distributed: bool, force_new: bool) -> Self {
        Self {
            worker,
            distributed,
            force_new,
        }
    }

    /// `true` when none of the flags is set.
    pub fn is_plain(&self) -> bool {
        !self.worker && !self.distributed && !self.force_new
    }

    /// The task must launch its own instance instead of reusing one.
    pub fn requires_isolation(&self) -> bool {
        !self.is_plain()
    }

    /// Worker-style ports are offset by task id so that concurrent
    /// workers on one host do not collide.
    pub fn uses_worker_port(&self) -> bool {
        self.worker || self.distributed
    }

    /// Launched instances accept external connections.
    pub fn listens_externally(&self) -> bool {
        self.uses_worker_port()
    }

    /// Both worker and distributed set: completion is never reported and
    /// the task stays alive for the coordinator.
    pub fn is_distributed_worker(&self) -> bool {
        self.worker && self.distributed
    }
}
