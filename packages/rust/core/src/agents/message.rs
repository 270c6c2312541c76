//! Typed messages exchanged between the supervisor and its workers.
//!
//! Messages are transient and never persisted.

use std::collections::BTreeSet;
use std::sync::Arc;

use adaptcrawl_shared::{FieldSchema, RawPage, Record, SelectorSpec, TaskId, Tuning};

/// Participants in the agent layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AgentRole {
    Supervisor,
    Explorer,
    Analyst,
    Optimizer,
    Validator,
}

impl AgentRole {
    /// The worker role responsible for a task kind.
    pub fn for_task(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Explore => Self::Explorer,
            TaskKind::Analyze => Self::Analyst,
            TaskKind::Optimize => Self::Optimizer,
            TaskKind::Validate => Self::Validator,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supervisor => "supervisor",
            Self::Explorer => "explorer",
            Self::Analyst => "analyst",
            Self::Optimizer => "optimizer",
            Self::Validator => "validator",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Explore,
    Analyze,
    Optimize,
    Validate,
}

/// Lifecycle of a worker as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    Idle,
    Busy,
    Error,
}

/// Input of a sub-task.
#[derive(Debug, Clone)]
pub enum TaskPayload {
    Explore {
        pages: Vec<RawPage>,
        schema: FieldSchema,
        hint: Option<SelectorSpec>,
    },
    Analyze {
        pages: Vec<RawPage>,
        schema: FieldSchema,
    },
    Optimize {
        pages_fetched: usize,
        fetch_failures: usize,
        transient_failures: usize,
        current_concurrency: usize,
        accept_threshold: f64,
    },
    Validate {
        records: Vec<Record>,
        schema: FieldSchema,
    },
}

/// A unit of work for one worker. The payload is shared and never mutated.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub payload: Arc<TaskPayload>,
    /// Higher runs first among tasks whose dependencies are met.
    pub priority: u8,
    pub depends_on: BTreeSet<TaskId>,
    /// Requeues left after a worker timeout.
    pub retries_left: u8,
}

impl Task {
    pub fn new(kind: TaskKind, payload: TaskPayload) -> Self {
        Self {
            task_id: TaskId::new(),
            kind,
            payload: Arc::new(payload),
            priority: 0,
            depends_on: BTreeSet::new(),
            retries_left: 1,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Run only after `task_id` has produced a result.
    pub fn after(mut self, task_id: TaskId) -> Self {
        self.depends_on.insert(task_id);
        self
    }
}

/// Result of a sub-task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    Explored {
        spec: Option<SelectorSpec>,
        item_count: usize,
    },
    Analyzed {
        spec: Option<SelectorSpec>,
        mean_confidence: f64,
        pages: usize,
    },
    Optimized(Tuning),
    Validated {
        issues: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Assign,
    Result,
    Status,
    Error,
}

#[derive(Debug, Clone)]
pub enum MessageBody {
    Assignment {
        task: Task,
        /// Outputs of the tasks this one depends on.
        upstream: Vec<TaskOutput>,
    },
    Output(TaskOutput),
    Status(WorkerState),
    Failure(String),
}

#[derive(Debug, Clone)]
pub struct AgentMessage {
    pub from: AgentRole,
    pub to: AgentRole,
    pub kind: MessageKind,
    pub correlation_id: TaskId,
    pub body: MessageBody,
}

impl AgentMessage {
    pub fn assign(to: AgentRole, task: Task, upstream: Vec<TaskOutput>) -> Self {
        Self {
            from: AgentRole::Supervisor,
            to,
            kind: MessageKind::Assign,
            correlation_id: task.task_id,
            body: MessageBody::Assignment { task, upstream },
        }
    }

    pub fn result(from: AgentRole, correlation_id: TaskId, output: TaskOutput) -> Self {
        Self {
            from,
            to: AgentRole::Supervisor,
            kind: MessageKind::Result,
            correlation_id,
            body: MessageBody::Output(output),
        }
    }

    pub fn status(from: AgentRole, correlation_id: TaskId, state: WorkerState) -> Self {
        Self {
            from,
            to: AgentRole::Supervisor,
            kind: MessageKind::Status,
            correlation_id,
            body: MessageBody::Status(state),
        }
    }

    pub fn error(from: AgentRole, correlation_id: TaskId, message: impl Into<String>) -> Self {
        Self {
            from,
            to: AgentRole::Supervisor,
            kind: MessageKind::Error,
            correlation_id,
            body: MessageBody::Failure(message.into()),
        }
    }
}
