//! Worker endpoint arbitration.
//!
//! Decides whether a task reuses a ComfyUI instance that is already
//! listening or launches its own, and on which port. Ports are derived
//! deterministically from GPU and task identity, then displaced by a
//! linear probe until a free one is found.

use std::future::Future;
use std::time::Duration;

use crate::roles::RoleFlags;
use crate::types::TaskId;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default ComfyUI HTTP port.
pub const DEFAULT_PORT: u16 = 8188;

/// Port shift per GPU index so co-located GPU-bound instances never collide.
pub const PORT_OFFSET_PER_GPU: u16 = 100;

/// Extra shift applied to worker/distributed roles before adding the task id.
pub const WORKER_PORT_OFFSET: u16 = 100;

/// Number of successive ports tried before giving up on probing.
pub const MAX_PORT_SEARCH_RANGE: u16 = 100;

/// Connect timeout of a single liveness probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Instances are always addressed on the loopback interface.
pub const LOCAL_HOST: &str = "127.0.0.1";

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// Whether the endpoint belongs to an instance that was already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceOrigin {
    /// Something was listening on the base port; adopt it, launch nothing.
    Reused,
    /// A new instance must be launched on this port.
    Launched,
}

/// Network address of the ComfyUI instance serving a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEndpoint {
    pub host: String,
    pub port: u16,
    /// Base HTTP URL, e.g. `http://127.0.0.1:8188`.
    pub base_url: String,
    pub origin: InstanceOrigin,
}

impl WorkerEndpoint {
    pub fn new(host: impl Into<String>, port: u16, origin: InstanceOrigin) -> Self {
        let host = host.into();
        let base_url = format!("http://{host}:{port}");
        Self {
            host,
            port,
            base_url,
            origin,
        }
    }

    pub fn is_reused(&self) -> bool {
        self.origin == InstanceOrigin::Reused
    }
}

// ---------------------------------------------------------------------------
// Probing
// ---------------------------------------------------------------------------

/// Liveness probe for a local port.
pub trait PortProbe: Send + Sync {
    /// `true` when something accepts connections on `port`.
    ///
    /// Implementations must fail open: a probe that cannot decide
    /// reports "not in use".
    fn is_in_use(&self, port: u16) -> impl Future<Output = bool> + Send;
}

/// TCP connect probe with a per-port timeout.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            timeout,
        }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(LOCAL_HOST, PROBE_TIMEOUT)
    }
}

impl PortProbe for TcpProbe {
    async fn is_in_use(&self, port: u16) -> bool {
        let connect = tokio::net::TcpStream::connect((self.host.as_str(), port));
        matches!(tokio::time::timeout(self.timeout, connect).await, Ok(Ok(_)))
    }
}

// ---------------------------------------------------------------------------
// Port arithmetic
// ---------------------------------------------------------------------------

/// Shift `base` by the GPU offset, when a GPU is assigned.
pub fn gpu_base_port(base: u16, gpu_index: Option<u32>) -> u16 {
    match gpu_index {
        Some(gpu) => {
            let shift = u32::from(PORT_OFFSET_PER_GPU).saturating_mul(gpu);
            clamp_port(u32::from(base).saturating_add(shift))
        }
        None => base,
    }
}

/// Candidate port for worker/distributed roles: `base + 100 + task_id`,
/// or `base + 100` when the task id is unknown.
pub fn worker_candidate_port(base: u16, task_id: Option<TaskId>) -> u16 {
    let shifted = u32::from(base) + u32::from(WORKER_PORT_OFFSET);
    clamp_port(shifted.saturating_add(task_id.unwrap_or(0)))
}

fn clamp_port(port: u32) -> u16 {
    u16::try_from(port).unwrap_or(u16::MAX)
}

/// Return the first port in `[start, start + MAX_PORT_SEARCH_RANGE)` the
/// probe reports free, or `start` itself when the whole range is taken.
pub async fn find_available_port<P: PortProbe>(probe: &P, start: u16) -> u16 {
    let end = (u32::from(start) + u32::from(MAX_PORT_SEARCH_RANGE)).min(u32::from(u16::MAX) + 1);
    for port in u32::from(start)..end {
        let port = port as u16;
        if !probe.is_in_use(port).await {
            return port;
        }
        tracing::debug!(port, "Port in use, trying next");
    }
    tracing::warn!(start, "No free port found in search range, using start port");
    start
}

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

/// Inputs to port arbitration for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRequest {
    /// Configured port (`ComfyUIPort`), before GPU shift.
    pub base_port: u16,
    pub gpu_index: Option<u32>,
    pub roles: RoleFlags,
    pub task_id: Option<TaskId>,
}

/// Chooses the worker endpoint for a task.
pub struct PortAllocator<P> {
    probe: P,
    host: String,
}

impl<P: PortProbe> PortAllocator<P> {
    pub fn new(probe: P) -> Self {
        Self {
            probe,
            host: LOCAL_HOST.to_string(),
        }
    }

    /// Decide reuse vs launch and pick the port.
    ///
    /// Isolating roles always launch. Plain tasks adopt an instance
    /// already listening on the (GPU-shifted) base port, or launch on the
    /// first free port from there.
    pub async fn allocate(&self, request: &PortRequest) -> WorkerEndpoint {
        let base = gpu_base_port(request.base_port, request.gpu_index);

        if request.roles.requires_isolation() {
            let candidate = if request.roles.uses_worker_port() {
                worker_candidate_port(base, request.task_id)
            } else {
                base
            };
            let port = find_available_port(&self.probe, candidate).await;
            tracing::info!(
                base,
                candidate,
                port,
                worker = request.roles.worker,
                distributed = request.roles.distributed,
                force_new = request.roles.force_new,
                "Isolated role: launching new instance",
            );
            return WorkerEndpoint::new(&self.host, port, InstanceOrigin::Launched);
        }

        if self.probe.is_in_use(base).await {
            tracing::info!(port = base, "ComfyUI already running, reusing existing instance");
            return WorkerEndpoint::new(&self.host, base, InstanceOrigin::Reused);
        }

        let port = find_available_port(&self.probe, base).await;
        tracing::info!(base, port, "No instance detected, launching new instance");
        WorkerEndpoint::new(&self.host, port, InstanceOrigin::Launched)
    }
}
