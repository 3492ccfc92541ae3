use crate::{
    config::UPLOAD_CONCURRENCY,
    models::{ListingDraft, ListingReceipt},
    pipeline::{Pipeline, PipelineError},
    session::SessionContext,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::{Semaphore, watch};
use tracing::{info, warn};
use uuid::Uuid;

/// Snapshot of every job. Readers hold an immutable copy; writers replace it.
pub type Registry = Arc<HashMap<Uuid, JobInfo>>;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Uploading,
    Succeeded {
        receipt: ListingReceipt,
    },
    Failed {
        error: String,
        stage: Option<String>,
    },
}

impl JobState {
    fn rank(&self) -> u8 {
        match self {
            JobState::Queued => 0,
            JobState::Uploading => 1,
            JobState::Succeeded { .. } | JobState::Failed { .. } => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: Uuid,
    pub label: String,
    #[serde(skip)]
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: JobState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub in_flight: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DismissError {
    #[error("job not found")]
    NotFound,
    #[error("job is still in flight")]
    InFlight,
}

#[derive(Clone)]
pub struct JobQueue {
    pipeline: Pipeline,
    registry: Arc<watch::Sender<Registry>>,
    slots: Arc<Semaphore>,
}

impl JobQueue {
    pub fn new(pipeline: Pipeline) -> Self {
        Self::with_concurrency(pipeline, *UPLOAD_CONCURRENCY)
    }

    pub fn with_concurrency(pipeline: Pipeline, concurrency: usize) -> Self {
        let (registry, _) = watch::channel(Registry::default());
        Self {
            pipeline,
            registry: Arc::new(registry),
            slots: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Validates the draft, registers a job and starts it in the background.
    ///
    /// Only validation errors reach the caller. Once an id is returned the job
    /// runs to completion on its own task and reports through the registry.
    pub fn submit(
        &self,
        session: SessionContext,
        draft: ListingDraft,
    ) -> Result<Uuid, PipelineError> {
        Pipeline::preflight(&draft)?;

        let id = Uuid::new_v4();
        let permit = self.slots.clone().try_acquire_owned().ok();
        let state = if permit.is_some() {
            JobState::Uploading
        } else {
            JobState::Queued
        };
        let job = JobInfo {
            id,
            label: draft.name.trim().to_string(),
            owner_id: session.user_id.clone(),
            created_at: Utc::now(),
            state,
        };
        self.registry.send_modify(|jobs| {
            Arc::make_mut(jobs).insert(id, job);
        });
        info!(target = "wayover.jobs", job_id = %id, user_id = %session.user_id, queued = permit.is_none(), "job_submitted");

        let queue = self.clone();
        tokio::spawn(async move {
            let _permit = match permit {
                Some(permit) => permit,
                None => match queue.slots.clone().acquire_owned().await {
                    Ok(permit) => {
                        queue.advance(id, JobState::Uploading);
                        permit
                    }
                    Err(err) => {
                        queue.advance(
                            id,
                            JobState::Failed {
                                error: err.to_string(),
                                stage: None,
                            },
                        );
                        return;
                    }
                },
            };

            let terminal = match queue.pipeline.run(&session, &draft).await {
                Ok(receipt) => {
                    info!(target = "wayover.jobs", job_id = %id, table = %receipt.table, images = receipt.images.len(), "job_succeeded");
                    crate::metrics::job_finished("succeeded");
                    JobState::Succeeded { receipt }
                }
                Err(err) => {
                    warn!(target = "wayover.jobs", job_id = %id, stage = err.stage(), error = %err.detail(), "job_failed");
                    crate::metrics::job_finished("failed");
                    JobState::Failed {
                        error: err.detail().to_string(),
                        stage: Some(err.stage().to_string()),
                    }
                }
            };
            queue.advance(id, terminal);
        });

        Ok(id)
    }

    /// Moves a job forward. Backward or repeated terminal transitions are ignored.
    fn advance(&self, id: Uuid, next: JobState) -> bool {
        self.registry.send_if_modified(|jobs| {
            let Some(current) = jobs.get(&id) else {
                return false;
            };
            if current.state.is_terminal() || next.rank() <= current.state.rank() {
                warn!(target = "wayover.jobs", job_id = %id, "job_transition_ignored");
                return false;
            }
            if let Some(job) = Arc::make_mut(jobs).get_mut(&id) {
                job.state = next;
            }
            true
        })
    }

    pub fn snapshot(&self) -> Registry {
        self.registry.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Registry> {
        self.registry.subscribe()
    }

    pub fn get(&self, id: Uuid) -> Option<JobInfo> {
        self.registry.borrow().get(&id).cloned()
    }

    /// The owner's jobs, oldest first.
    pub fn list(&self, owner_id: &str) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self
            .snapshot()
            .values()
            .filter(|job| job.owner_id == owner_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub fn counts(&self, owner_id: &str) -> JobCounts {
        let snapshot = self.snapshot();
        let mut counts = JobCounts::default();
        for job in snapshot.values().filter(|job| job.owner_id == owner_id) {
            match job.state {
                JobState::Queued | JobState::Uploading => counts.in_flight += 1,
                JobState::Succeeded { .. } => counts.succeeded += 1,
                JobState::Failed { .. } => counts.failed += 1,
            }
        }
        counts
    }

    /// Removes a finished job. Jobs still queued or uploading stay put.
    pub fn dismiss(&self, owner_id: &str, id: Uuid) -> Result<JobInfo, DismissError> {
        let mut outcome = Err(DismissError::NotFound);
        self.registry.send_if_modified(|jobs| {
            match jobs.get(&id) {
                Some(job) if job.owner_id == owner_id => {
                    if !job.state.is_terminal() {
                        outcome = Err(DismissError::InFlight);
                        return false;
                    }
                }
                _ => return false,
            }
            match Arc::make_mut(jobs).remove(&id) {
                Some(job) => {
                    outcome = Ok(job);
                    true
                }
                None => false,
            }
        });
        outcome
    }
}
