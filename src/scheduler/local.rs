/// In-process Job Scheduler
///
/// Uses tokio-cron-scheduler for timing and reqwest for delivery, so the engine calls its
/// own execution endpoint exactly as a remote dispatcher would. Job UUIDs are tracked so
/// that deactivation can remove a pending job without restarting the scheduler.

use crate::scheduler::{deliver, CronRequest, DispatchRequest, JobScheduler};
use anyhow::Result;
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler as CronEngine};
use uuid::Uuid;

#[derive(Clone)]
pub struct LocalJobScheduler {
    scheduler: CronEngine,
    /// Job id handed to callers -> tokio-cron-scheduler job UUID
    jobs: Arc<RwLock<HashMap<String, Uuid>>>,
    client: reqwest::Client,
}

impl LocalJobScheduler {
    pub async fn new() -> Result<Self> {
        let scheduler = CronEngine::new().await?;

        Ok(Self {
            scheduler,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            client: reqwest::Client::new(),
        })
    }

    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting in-process job scheduler");
        self.scheduler.start().await?;
        Ok(())
    }

    /// Number of pending one-shot and recurring jobs
    pub async fn pending_jobs(&self) -> usize {
        self.jobs.read().await.len()
    }

    async fn track(&self, job: Job) -> Result<String> {
        let job_uuid = self.scheduler.add(job).await?;
        let id = job_uuid.to_string();
        self.jobs.write().await.insert(id.clone(), job_uuid);
        Ok(id)
    }
}

/// tokio-cron-scheduler expects a leading seconds field
pub(crate) fn with_seconds_field(cron: &str) -> String {
    if cron.split_whitespace().count() == 5 {
        format!("0 {}", cron.trim())
    } else {
        cron.trim().to_string()
    }
}

#[async_trait]
impl JobScheduler for LocalJobScheduler {
    async fn publish(&self, request: DispatchRequest) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let delay_secs = request.not_before.map(|at| (at - now).max(0)).unwrap_or(0) as u64;

        let client = self.client.clone();
        let jobs = Arc::clone(&self.jobs);
        let request = Arc::new(request);

        let job = Job::new_one_shot_async(Duration::from_secs(delay_secs), move |job_uuid, _l| {
            let client = client.clone();
            let jobs = Arc::clone(&jobs);
            let request = Arc::clone(&request);

            Box::pin(async move {
                jobs.write().await.remove(&job_uuid.to_string());
                tracing::info!("🔔 One-shot job fired: {} -> {}", job_uuid, request.destination);
                deliver(
                    &client,
                    &request.destination,
                    &request.body,
                    request.retries,
                    request.failure_callback.as_deref(),
                )
                .await;
            })
        })?;

        let id = self.track(job).await?;
        tracing::info!("📝 Registered one-shot job {} (in {}s)", id, delay_secs);
        Ok(id)
    }

    async fn schedule(&self, request: CronRequest) -> Result<String> {
        let schedule = with_seconds_field(&request.cron);

        let client = self.client.clone();
        let request = Arc::new(request);

        let job = Job::new_async(schedule.as_str(), move |job_uuid, _l| {
            let client = client.clone();
            let request = Arc::clone(&request);

            Box::pin(async move {
                tracing::info!("🔔 Cron job fired: {} -> {}", job_uuid, request.destination);
                deliver(
                    &client,
                    &request.destination,
                    &request.body,
                    request.retries,
                    request.failure_callback.as_deref(),
                )
                .await;
            })
        })?;

        let id = self.track(job).await?;
        tracing::info!("📝 Registered cron job {} ({})", id, schedule);
        Ok(id)
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        let removed = self.jobs.write().await.remove(id);
        match removed {
            Some(job_uuid) => {
                self.scheduler.remove(&job_uuid).await?;
                tracing::info!("🛑 Removed job from scheduler: {}", id);
            }
            None => tracing::debug!("⏭️ Job {} already gone", id),
        }
        Ok(())
    }
}
