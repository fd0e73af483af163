use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a run.
///
/// `Paused` always has exactly one outstanding pending decision; `Completed`
/// and `Failed` are terminal and accept no further transitions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Coarse outcome category of a pending decision.
///
/// The decision *value* is open-vocabulary and stored verbatim next to this
/// closed enum; see [`normalize_decision`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Cancelled,
    AutoApproved,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
            Self::AutoApproved => "auto_approved",
        }
    }

    /// Whether a decision in this status has been decided by someone.
    /// `Expired` and `Cancelled` rows were closed by the system, not decided.
    pub fn is_decided(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::AutoApproved)
    }
}

impl std::fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            "cancelled" => Ok(Self::Cancelled),
            "auto_approved" => Ok(Self::AutoApproved),
            _ => Err(format!("Invalid decision status: {}", s)),
        }
    }
}

/// Status tag of a progress event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Started,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid event status: {}", s)),
        }
    }
}

/// One selectable option presented to the decision-maker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionOption {
    pub id: String,
    pub label: String,
    pub description: String,
}

impl DecisionOption {
    pub fn new(id: &str, label: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            description: description.to_string(),
        }
    }
}

/// Checkpoint descriptor raised by a phase executor when it requests
/// suspension. The `name` is the natural key for resume matching and must be
/// stable within the run's phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub name: String,
    pub title: String,
    pub description: String,
    pub context: serde_json::Value,
    pub options: Vec<DecisionOption>,
    pub recommended_option: Option<String>,
}

/// The unit of work: one end-to-end execution of the phase sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    pub current_phase: i64,
    pub status: RunStatus,
    pub state: serde_json::Value,
    pub pending_checkpoint: Option<Checkpoint>,
    pub error: Option<String>,
    pub retry_count: i64,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: String,
}

/// Append-only progress log entry. Never updated or deleted after insertion;
/// this is the audit trail and the only source of "what happened" history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub id: i64,
    pub run_id: String,
    pub phase_index: i64,
    pub label: String,
    pub status: EventStatus,
    pub percent: Option<i64>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub created_at: String,
}

/// Persisted record of one outstanding (or settled) checkpoint.
///
/// At most one `pending`-status row may exist per (run_id, checkpoint_name)
/// pair at any time; the store enforces this with a partial unique index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: i64,
    pub run_id: String,
    pub checkpoint_name: String,
    pub phase_index: i64,
    pub title: String,
    pub description: String,
    pub context: serde_json::Value,
    pub options: Vec<DecisionOption>,
    pub recommended_option: Option<String>,
    pub status: DecisionStatus,
    pub decision: Option<String>,
    pub feedback: Option<String>,
    pub decided_by: Option<String>,
    pub decided_at: Option<String>,
    pub expires_at: String,
    pub created_at: String,
}

impl Decision {
    /// Reconstruct the checkpoint descriptor this decision was raised with.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            name: self.checkpoint_name.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            context: self.context.clone(),
            options: self.options.clone(),
            recommended_option: self.recommended_option.clone(),
        }
    }
}

/// Map an open-vocabulary decision value onto the closed status enum.
///
/// `"rejected"` closes the checkpoint as rejected; `"iterate"` keeps the
/// status pending and re-enters the suspending phase (the one designed
/// exception to forward-only phase progression); every other value approves,
/// with the verbatim string preserved for phase logic to branch on.
pub fn normalize_decision(decision: &str) -> DecisionStatus {
    match decision {
        "rejected" => DecisionStatus::Rejected,
        "iterate" => DecisionStatus::Pending,
        _ => DecisionStatus::Approved,
    }
}

/// Deep-merge `patch` into `base`: objects merge recursively, everything
/// else (scalars, arrays, nulls) replaces the slot wholesale.
pub fn merge_snapshots(base: &mut serde_json::Value, patch: &serde_json::Value) {
    if let (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) =
        (&mut *base, patch)
    {
        for (key, value) in patch_map {
            merge_snapshots(
                base_map
                    .entry(key.clone())
                    .or_insert(serde_json::Value::Null),
                value,
            );
        }
    } else {
        *base = patch.clone();
    }
}
