//! Per-task seed mutation for workflow graphs.
//!
//! A chunk of N prompts must not render N identical images, so every
//! seed-bearing input of every node is rewritten according to the job's
//! [`SeedPolicy`] and the node's own `control_after_generate` setting.
//!
//! Graphs containing `DeadlineSeed` nodes take a different path: the task
//! offset is injected into those nodes as an explicit `task_id` input and
//! the generic mutation pass is skipped for the whole submission.

use std::str::FromStr;

use rand::Rng;
use serde_json::Value;

use crate::types::TaskId;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Upper bound (inclusive) for randomized seeds.
pub const MAX_SEED_VALUE: i64 = 2_147_483_647;

/// Input names treated as seeds on any node.
pub const SEED_PARAMETER_NAMES: [&str; 3] = ["seed", "noise_seed", "value"];

/// Per-node input selecting the auto sub-mode.
pub const CONTROL_MODE_INPUT: &str = "control_after_generate";

/// Node class that receives the task offset instead of a mutated seed.
pub const DISTRIBUTED_SEED_CLASS: &str = "DeadlineSeed";

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Job-wide seed policy (`SeedMode` plugin-info entry).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SeedPolicy {
    /// Seeds are left untouched.
    #[default]
    Fixed,
    /// Every seed is replaced by a random value.
    Change,
    /// Each node's `control_after_generate` decides.
    Auto,
}

impl SeedPolicy {
    /// Parse the plugin-info setting. Unrecognized values randomize,
    /// matching the behaviour of the `change` policy.
    pub fn from_setting(value: &str) -> Self {
        value.parse().unwrap_or_else(|_| {
            tracing::warn!(seed_mode = %value, "Unknown seed mode, treating as 'change'");
            Self::Change
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Change => "change",
            Self::Auto => "auto",
        }
    }
}

impl FromStr for SeedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "change" => Ok(Self::Change),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown seed mode '{other}'")),
        }
    }
}

/// Per-node sub-mode used under [`SeedPolicy::Auto`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    Fixed,
    Increment,
    Decrement,
    Randomize,
}

impl ControlMode {
    /// Read the control mode from a node's inputs. Missing or unknown
    /// values behave as `increment`.
    pub fn from_inputs(inputs: &serde_json::Map<String, Value>) -> Self {
        match inputs.get(CONTROL_MODE_INPUT).and_then(Value::as_str) {
            Some("fixed") => Self::Fixed,
            Some("decrement") => Self::Decrement,
            Some("randomize") => Self::Randomize,
            _ => Self::Increment,
        }
    }
}

/// Uniformly random seed in `[0, MAX_SEED_VALUE]`.
pub fn random_seed() -> i64 {
    rand::rng().random_range(0..=MAX_SEED_VALUE)
}

/// Compute the replacement for `original` at chunk/task `offset`.
///
/// Deterministic except for the randomizing branches.
pub fn mutate(original: i64, offset: i64, policy: SeedPolicy, control: ControlMode) -> i64 {
    match policy {
        SeedPolicy::Fixed => original,
        SeedPolicy::Change => random_seed(),
        SeedPolicy::Auto => match control {
            ControlMode::Fixed => original,
            ControlMode::Increment => original.saturating_add(offset),
            ControlMode::Decrement => original.saturating_sub(offset).max(0),
            ControlMode::Randomize => random_seed(),
        },
    }
}

// ---------------------------------------------------------------------------
// Graph passes
// ---------------------------------------------------------------------------

/// A seed input that was rewritten.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedChange {
    pub node_id: String,
    pub class_type: String,
    pub param: String,
    pub from: i64,
    pub to: i64,
}

/// A seed-named input whose value is not an integer (links, widgets).
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedSeed {
    pub node_id: String,
    pub param: String,
    pub value: String,
}

/// Result of one generic mutation pass over a graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeedReport {
    pub changed: Vec<SeedChange>,
    pub kept: usize,
    pub skipped: Vec<SkippedSeed>,
}

impl SeedReport {
    pub fn is_modified(&self) -> bool {
        !self.changed.is_empty()
    }
}

/// Which seeding strategy was applied to one prompt graph.
#[derive(Debug, Clone, PartialEq)]
pub enum SeedingApplied {
    /// `DeadlineSeed` nodes received the offset; generic pass skipped.
    DistributedSeed { nodes: usize },
    /// Generic pass over seed-named inputs.
    Mutated(SeedReport),
}

/// Coerce a JSON input to an integer seed the way a loose `int()` would:
/// integers, integral floats and numeric strings are accepted.
fn seed_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok()))
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn class_type(node: &Value) -> &str {
    node.get("class_type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
}

/// Rewrite every recognized seed input in `graph` for `offset`.
///
/// Non-numeric values are reported in [`SeedReport::skipped`], never
/// treated as errors. A `fixed` policy returns an empty report without
/// visiting the graph.
pub fn apply_seed_policy(graph: &mut Value, offset: i64, policy: SeedPolicy) -> SeedReport {
    let mut report = SeedReport::default();
    if policy == SeedPolicy::Fixed {
        return report;
    }

    let Some(nodes) = graph.as_object_mut() else {
        return report;
    };

    for (node_id, node) in nodes.iter_mut() {
        let class = class_type(node).to_string();
        let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) else {
            continue;
        };
        let control = ControlMode::from_inputs(inputs);

        for param in SEED_PARAMETER_NAMES {
            let Some(current) = inputs.get(param) else {
                continue;
            };
            match seed_value(current) {
                Some(original) => {
                    let new_seed = mutate(original, offset, policy, control);
                    if new_seed != original {
                        inputs.insert(param.to_string(), Value::from(new_seed));
                        report.changed.push(SeedChange {
                            node_id: node_id.clone(),
                            class_type: class.clone(),
                            param: param.to_string(),
                            from: original,
                            to: new_seed,
                        });
                    } else {
                        report.kept += 1;
                    }
                }
                None => report.skipped.push(SkippedSeed {
                    node_id: node_id.clone(),
                    param: param.to_string(),
                    value: current.to_string(),
                }),
            }
        }
    }

    report
}

/// `true` when any node is a [`DISTRIBUTED_SEED_CLASS`] node.
pub fn has_distributed_seed_nodes(graph: &Value) -> bool {
    graph
        .as_object()
        .is_some_and(|nodes| nodes.values().any(|n| class_type(n) == DISTRIBUTED_SEED_CLASS))
}

/// Call `f` with the inputs object of every distributed seed node,
/// creating the object when absent. Returns the number of nodes visited.
fn for_each_distributed_seed(
    graph: &mut Value,
    mut f: impl FnMut(&str, &mut serde_json::Map<String, Value>),
) -> usize {
    let Some(nodes) = graph.as_object_mut() else {
        return 0;
    };
    let mut count = 0;
    for (node_id, node) in nodes.iter_mut() {
        if class_type(node) != DISTRIBUTED_SEED_CLASS {
            continue;
        }
        let Some(node_obj) = node.as_object_mut() else {
            continue;
        };
        let inputs = node_obj
            .entry("inputs")
            .or_insert_with(|| Value::Object(Default::default()));
        if !inputs.is_object() {
            *inputs = Value::Object(Default::default());
        }
        if let Some(inputs) = inputs.as_object_mut() {
            f(node_id, inputs);
            count += 1;
        }
    }
    count
}

/// Set `task_id` and `batch_mode` on every distributed seed node.
pub fn inject_distributed_seed(graph: &mut Value, task_id: i64, batch_mode: bool) -> usize {
    for_each_distributed_seed(graph, |node_id, inputs| {
        inputs.insert("task_id".to_string(), Value::from(task_id));
        inputs.insert("batch_mode".to_string(), Value::from(batch_mode));
        tracing::info!(node_id, task_id, batch_mode, "Injected task id into distributed seed node");
    })
}

/// Add `offset` to the `task_id` already present on every distributed
/// seed node (chunk-local indexing).
pub fn offset_distributed_seed(graph: &mut Value, offset: i64) -> usize {
    for_each_distributed_seed(graph, |node_id, inputs| {
        let base = inputs.get("task_id").and_then(seed_value).unwrap_or(0);
        let task_id = base.saturating_add(offset);
        inputs.insert("task_id".to_string(), Value::from(task_id));
        tracing::debug!(node_id, task_id, "Offset distributed seed node");
    })
}

// ---------------------------------------------------------------------------
// Seed plan
// ---------------------------------------------------------------------------

/// Seeding configuration for one task.
///
/// The two strategies are mutually exclusive per graph: once a graph
/// carries distributed seed nodes, the generic pass never runs on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedPlan {
    pub policy: SeedPolicy,
    pub batch_mode: bool,
}

impl SeedPlan {
    pub fn new(policy: SeedPolicy, batch_mode: bool) -> Self {
        Self { policy, batch_mode }
    }

    /// Task-level pass applied once to the loaded graph; the result is
    /// prompt 0 of the chunk and the base for every later prompt.
    pub fn seed_task_graph(&self, graph: &mut Value, task_id: TaskId) -> SeedingApplied {
        let nodes = inject_distributed_seed(graph, i64::from(task_id), self.batch_mode);
        if nodes > 0 {
            return SeedingApplied::DistributedSeed { nodes };
        }
        SeedingApplied::Mutated(apply_seed_policy(graph, i64::from(task_id), self.policy))
    }

    /// Build prompt `index` (1-based within the chunk) from the seeded
    /// base graph. The base is never modified.
    pub fn seed_chunk_prompt(&self, base: &Value, index: u32) -> (Value, SeedingApplied) {
        let mut graph = base.clone();
        let offset = i64::from(index);
        if has_distributed_seed_nodes(&graph) {
            let nodes = offset_distributed_seed(&mut graph, offset);
            return (graph, SeedingApplied::DistributedSeed { nodes });
        }
        let report = apply_seed_policy(&mut graph, offset, self.policy);
        (graph, SeedingApplied::Mutated(report))
    }
}
