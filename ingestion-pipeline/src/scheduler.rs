use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use common::error::AppError;
use common::storage::types::document::{JsonMap, SourceKind};
use common::storage::types::job::{JobStore, PipelineJob};

use crate::executor::JobExecutor;

const MIN_INTERVAL: Duration = Duration::from_secs(60);
const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// When a recurring submission fires: a cron expression or a fixed
/// interval bounded to 60 s..24 h.
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    Cron(String),
    Interval(Duration),
}

impl ScheduleSpec {
    pub fn validate(&self) -> Result<(), AppError> {
        match self {
            Self::Cron(expression) => {
                Schedule::from_str(expression).map_err(|e| {
                    AppError::Validation(format!("invalid cron expression '{expression}': {e}"))
                })?;
                Ok(())
            }
            Self::Interval(interval) => {
                if *interval < MIN_INTERVAL || *interval > MAX_INTERVAL {
                    return Err(AppError::Validation(format!(
                        "interval must be between {}s and {}s, got {}s",
                        MIN_INTERVAL.as_secs(),
                        MAX_INTERVAL.as_secs(),
                        interval.as_secs()
                    )));
                }
                Ok(())
            }
        }
    }

    /// Time until the next firing, or `None` when the schedule is
    /// exhausted.
    fn next_delay(&self) -> Option<Duration> {
        match self {
            Self::Cron(expression) => {
                let schedule = Schedule::from_str(expression).ok()?;
                let next = schedule.upcoming(Utc).next()?;
                (next - Utc::now()).to_std().ok()
            }
            Self::Interval(interval) => Some(*interval),
        }
    }
}

/// Definition of one recurring submission.
#[derive(Debug, Clone)]
pub struct ScheduledJobSpec {
    pub name: String,
    pub source_kind: SourceKind,
    pub tenant_id: Option<String>,
    pub source_params: JsonMap,
    pub schedule: ScheduleSpec,
}

/// Listing entry for the scheduler surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJobInfo {
    pub id: String,
    pub name: String,
    pub source_kind: SourceKind,
    pub paused: bool,
}

struct ScheduledEntry {
    spec: ScheduledJobSpec,
    paused: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Recurring job submissions. A trigger merely constructs a submission
/// and forwards it to the executor; pause/resume/remove act on the
/// scheduler entry, never on in-flight jobs.
pub struct JobScheduler {
    executor: Arc<JobExecutor>,
    job_store: JobStore,
    entries: Mutex<HashMap<String, ScheduledEntry>>,
}

impl JobScheduler {
    pub fn new(executor: Arc<JobExecutor>, job_store: JobStore) -> Self {
        Self {
            executor,
            job_store,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn add_job(&self, spec: ScheduledJobSpec) -> Result<String, AppError> {
        spec.schedule.validate()?;

        let hex = Uuid::new_v4().simple().to_string();
        let id = format!("sched-{}", &hex[..12]);
        let paused = Arc::new(AtomicBool::new(false));

        let task_spec = spec.clone();
        let task_paused = Arc::clone(&paused);
        let executor = Arc::clone(&self.executor);
        let job_store = self.job_store.clone();
        let entry_id = id.clone();

        let handle = tokio::spawn(async move {
            loop {
                let Some(delay) = task_spec.schedule.next_delay() else {
                    warn!(schedule_id = %entry_id, "schedule exhausted, stopping");
                    break;
                };
                tokio::time::sleep(delay).await;

                if task_paused.load(Ordering::SeqCst) {
                    continue;
                }

                let mut params = task_spec.source_params.clone();
                params.insert("scheduled".to_string(), json!(true));
                params.insert("schedule_name".to_string(), json!(task_spec.name));

                let job = PipelineJob::new(
                    task_spec.source_kind,
                    Uuid::new_v4().to_string(),
                    task_spec.tenant_id.clone(),
                    params,
                );

                info!(
                    schedule_id = %entry_id,
                    schedule = %task_spec.name,
                    job_id = %job.id,
                    "scheduled trigger fired"
                );

                match job_store.create(job.clone()).await {
                    Ok(_) => executor.submit(job),
                    Err(err) => {
                        error!(
                            schedule_id = %entry_id,
                            error = %err,
                            "failed to persist scheduled job"
                        );
                    }
                }
            }
        });

        info!(schedule_id = %id, schedule = %spec.name, "scheduled job added");

        self.entries.lock().await.insert(
            id.clone(),
            ScheduledEntry {
                spec,
                paused,
                handle,
            },
        );

        Ok(id)
    }

    pub async fn remove_job(&self, id: &str) -> bool {
        match self.entries.lock().await.remove(id) {
            Some(entry) => {
                entry.handle.abort();
                info!(schedule_id = %id, "scheduled job removed");
                true
            }
            None => false,
        }
    }

    pub async fn pause_job(&self, id: &str) -> bool {
        match self.entries.lock().await.get(id) {
            Some(entry) => {
                entry.paused.store(true, Ordering::SeqCst);
                info!(schedule_id = %id, "scheduled job paused");
                true
            }
            None => false,
        }
    }

    pub async fn resume_job(&self, id: &str) -> bool {
        match self.entries.lock().await.get(id) {
            Some(entry) => {
                entry.paused.store(false, Ordering::SeqCst);
                info!(schedule_id = %id, "scheduled job resumed");
                true
            }
            None => false,
        }
    }

    pub async fn list_jobs(&self) -> Vec<ScheduledJobInfo> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|(id, entry)| ScheduledJobInfo {
                id: id.clone(),
                name: entry.spec.name.clone(),
                source_kind: entry.spec.source_kind,
                paused: entry.paused.load(Ordering::SeqCst),
            })
            .collect()
    }

    pub async fn shutdown(&self) {
        let mut entries = self.entries.lock().await;
        for (id, entry) in entries.drain() {
            entry.handle.abort();
            info!(schedule_id = %id, "scheduled job stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_bounds_enforced() {
        assert!(ScheduleSpec::Interval(Duration::from_secs(59))
            .validate()
            .is_err());
        assert!(ScheduleSpec::Interval(Duration::from_secs(60))
            .validate()
            .is_ok());
        assert!(ScheduleSpec::Interval(Duration::from_secs(24 * 60 * 60))
            .validate()
            .is_ok());
        assert!(ScheduleSpec::Interval(Duration::from_secs(24 * 60 * 60 + 1))
            .validate()
            .is_err());
    }

    #[test]
    fn cron_expressions_are_validated() {
        assert!(ScheduleSpec::Cron("0 0 2 * * *".to_string())
            .validate()
            .is_ok());
        assert!(ScheduleSpec::Cron("definitely not cron".to_string())
            .validate()
            .is_err());
    }

    #[test]
    fn interval_next_delay_is_the_interval() {
        let spec = ScheduleSpec::Interval(Duration::from_secs(300));
        assert_eq!(spec.next_delay(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn cron_next_delay_is_in_the_future() {
        let spec = ScheduleSpec::Cron("0 0 2 * * *".to_string());
        let delay = spec.next_delay().expect("next firing");
        assert!(delay <= Duration::from_secs(24 * 60 * 60));
    }
}
