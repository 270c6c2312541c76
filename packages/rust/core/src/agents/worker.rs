//! Specialised workers and their mailbox loop.
//!
//! Each worker runs as its own tokio task, reading [`AgentMessage`]s from an
//! `mpsc` inbox and replying on the supervisor's channel. Workers own no
//! shared mutable state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use adaptcrawl_crawler::{apply_spec, detect_structure};
use adaptcrawl_shared::{
    AdaptError, ExtractionResult, FieldSchema, Record, Result, SelectorSpec, StrategyKind, Tuning,
    content_hash,
};

use super::message::{AgentMessage, AgentRole, MessageBody, Task, TaskOutput, TaskPayload, WorkerState};
use crate::scorer::ConfidenceScorer;

/// Inbox capacity per worker.
const INBOX_CAPACITY: usize = 16;

/// Failure rate above which the optimizer halves concurrency.
const TRANSIENT_RATE_LIMIT: f64 = 0.2;

/// Behaviour of one worker role.
#[async_trait]
pub trait AgentWorker: Send + Sync {
    fn role(&self) -> AgentRole;

    async fn handle(&self, task: &Task, upstream: &[TaskOutput]) -> Result<TaskOutput>;
}

/// Start the mailbox loop for `worker`. Returns its inbox and task handle.
pub fn spawn_worker(
    worker: Arc<dyn AgentWorker>,
    outbox: mpsc::Sender<AgentMessage>,
) -> (mpsc::Sender<AgentMessage>, JoinHandle<()>) {
    let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
    let handle = tokio::spawn(run_worker(worker, inbox_rx, outbox));
    (inbox_tx, handle)
}

async fn run_worker(
    worker: Arc<dyn AgentWorker>,
    mut inbox: mpsc::Receiver<AgentMessage>,
    outbox: mpsc::Sender<AgentMessage>,
) {
    let role = worker.role();
    while let Some(message) = inbox.recv().await {
        let MessageBody::Assignment { task, upstream } = message.body else {
            debug!(%role, kind = ?message.kind, "ignoring non-assignment message");
            continue;
        };

        let busy = AgentMessage::status(role, task.task_id, WorkerState::Busy);
        if outbox.send(busy).await.is_err() {
            break;
        }

        let reply = match worker.handle(&task, &upstream).await {
            Ok(output) => AgentMessage::result(role, task.task_id, output),
            Err(e) => {
                warn!(%role, task_id = %task.task_id, error = %e, "worker task failed");
                AgentMessage::error(role, task.task_id, e.to_string())
            }
        };
        if outbox.send(reply).await.is_err() {
            break;
        }
    }
    debug!(%role, "worker stopped");
}

fn unexpected(role: AgentRole) -> AdaptError {
    AdaptError::validation(format!("{role} received a payload it cannot handle"))
}

// ---------------------------------------------------------------------------
// Explorer
// ---------------------------------------------------------------------------

/// Detects the item structure on sample pages and votes on a selector spec.
#[derive(Debug, Default)]
pub struct Explorer;

#[async_trait]
impl AgentWorker for Explorer {
    fn role(&self) -> AgentRole {
        AgentRole::Explorer
    }

    async fn handle(&self, task: &Task, _upstream: &[TaskOutput]) -> Result<TaskOutput> {
        let TaskPayload::Explore {
            pages,
            schema,
            hint,
        } = task.payload.as_ref()
        else {
            return Err(unexpected(self.role()));
        };

        let mut votes: HashMap<SelectorSpec, (usize, usize)> = HashMap::new();
        for page in pages {
            if let Some(detected) = detect_structure(&page.body, schema, hint.as_ref()) {
                let entry = votes.entry(detected.spec).or_default();
                entry.0 += 1;
                entry.1 = entry.1.max(detected.item_count);
            }
        }

        let winner = votes
            .into_iter()
            .max_by(|a, b| (a.1.0, a.1.1).cmp(&(b.1.0, b.1.1)));
        Ok(match winner {
            Some((spec, (_, item_count))) => TaskOutput::Explored {
                spec: Some(spec),
                item_count,
            },
            None => TaskOutput::Explored {
                spec: None,
                item_count: 0,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Analyst
// ---------------------------------------------------------------------------

/// Scores the explored spec on every sample page.
#[derive(Debug, Default)]
pub struct Analyst {
    scorer: ConfidenceScorer,
}

impl Analyst {
    pub fn new(scorer: ConfidenceScorer) -> Self {
        Self { scorer }
    }
}

#[async_trait]
impl AgentWorker for Analyst {
    fn role(&self) -> AgentRole {
        AgentRole::Analyst
    }

    async fn handle(&self, task: &Task, upstream: &[TaskOutput]) -> Result<TaskOutput> {
        let TaskPayload::Analyze { pages, schema } = task.payload.as_ref() else {
            return Err(unexpected(self.role()));
        };

        let spec = upstream.iter().find_map(|o| match o {
            TaskOutput::Explored { spec, .. } => spec.clone(),
            _ => None,
        });
        let Some(spec) = spec else {
            return Ok(TaskOutput::Analyzed {
                spec: None,
                mean_confidence: 0.0,
                pages: pages.len(),
            });
        };

        let scores: Vec<f64> = pages
            .iter()
            .map(|page| match apply_spec(&page.body, &spec) {
                Ok(items) => self.scorer.score(
                    &ExtractionResult::from_items(StrategyKind::Deterministic, items),
                    schema,
                ),
                Err(_) => 0.0,
            })
            .collect();
        let mean_confidence = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };

        Ok(TaskOutput::Analyzed {
            spec: Some(spec),
            mean_confidence,
            pages: pages.len(),
        })
    }
}

// ---------------------------------------------------------------------------
// Optimizer
// ---------------------------------------------------------------------------

/// Suggests concurrency and records expectations for the ladder.
#[derive(Debug, Default)]
pub struct Optimizer;

#[async_trait]
impl AgentWorker for Optimizer {
    fn role(&self) -> AgentRole {
        AgentRole::Optimizer
    }

    async fn handle(&self, task: &Task, upstream: &[TaskOutput]) -> Result<TaskOutput> {
        let TaskPayload::Optimize {
            pages_fetched,
            fetch_failures,
            transient_failures,
            current_concurrency,
            accept_threshold,
        } = task.payload.as_ref()
        else {
            return Err(unexpected(self.role()));
        };

        let mut tuning = Tuning::default();

        let attempted = pages_fetched + fetch_failures;
        if attempted > 0 {
            let rate = *transient_failures as f64 / attempted as f64;
            if rate > TRANSIENT_RATE_LIMIT && *current_concurrency > 1 {
                let reduced = (current_concurrency / 2).max(1);
                tuning.max_concurrency = Some(reduced);
                tuning.notes.push(format!(
                    "transient failure rate {:.0}%, concurrency {current_concurrency} -> {reduced}",
                    rate * 100.0
                ));
            }
        }

        let analysis = upstream.iter().find_map(|o| match o {
            TaskOutput::Analyzed {
                mean_confidence, ..
            } => Some(*mean_confidence),
            _ => None,
        });
        match analysis {
            Some(score) if score >= *accept_threshold => tuning.notes.push(format!(
                "sampled structure scores {score:.2}; deterministic extraction should hold"
            )),
            Some(score) => tuning.notes.push(format!(
                "sampled structure scores {score:.2}; expect ladder escalation"
            )),
            None => tuning.notes.push("no structure analysis available".into()),
        }

        Ok(TaskOutput::Optimized(tuning))
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

/// Checks extracted records against the schema.
#[derive(Debug, Default)]
pub struct Validator;

impl Validator {
    fn issues(records: &[Record], schema: &FieldSchema) -> Vec<String> {
        let mut issues = Vec::new();
        let total = records.len();

        for field in &schema.fields {
            let missing = records
                .iter()
                .filter(|r| r.fields.get(&field.name).is_none_or(|v| v.is_blank()))
                .count();
            if field.required && missing > 0 {
                issues.push(format!(
                    "{missing} of {total} records missing required field '{}'",
                    field.name
                ));
            }

            let invalid = records
                .iter()
                .filter(|r| {
                    r.fields
                        .get(&field.name)
                        .is_some_and(|v| v.iter().any(|raw| !field.kind.accepts(raw)))
                })
                .count();
            if invalid > 0 {
                issues.push(format!(
                    "{invalid} records have invalid {:?} values in '{}'",
                    field.kind, field.name
                ));
            }
        }

        let mut seen = std::collections::HashSet::new();
        let duplicates = records
            .iter()
            .filter(|r| !seen.insert(content_hash(&r.fields)))
            .count();
        if duplicates > 0 {
            issues.push(format!("{duplicates} duplicate records"));
        }
        issues
    }
}

#[async_trait]
impl AgentWorker for Validator {
    fn role(&self) -> AgentRole {
        AgentRole::Validator
    }

    async fn handle(&self, task: &Task, _upstream: &[TaskOutput]) -> Result<TaskOutput> {
        let TaskPayload::Validate { records, schema } = task.payload.as_ref() else {
            return Err(unexpected(self.role()));
        };
        Ok(TaskOutput::Validated {
            issues: Self::issues(records, schema),
        })
    }
}
