use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{DiagError, DiagResult};

type ScheduleFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ScheduleStatus {
    pub name: String,
    pub interval_ms: i64,
    pub running: bool,
    pub started: bool,
    pub last_run: Option<i64>,
    pub next_run: Option<i64>,
    pub run_count: u64,
}

struct Schedule {
    interval_ms: i64,
    job: ScheduleFn,
    started: bool,
    running: Arc<Mutex<()>>,
    last_run: Option<i64>,
    next_run: Option<i64>,
    run_count: u64,
}

/// Named periodic schedules. A schedule whose previous run is still in
/// flight skips the missed fire instead of queuing it.
pub struct Scheduler {
    schedules: Mutex<HashMap<String, Schedule>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            schedules: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register<F, Fut>(&self, name: &str, interval_ms: i64, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let job: ScheduleFn = Arc::new(move || Box::pin(job()));
        self.schedules.lock().await.insert(
            name.to_string(),
            Schedule {
                interval_ms,
                job,
                started: false,
                running: Arc::new(Mutex::new(())),
                last_run: None,
                next_run: None,
                run_count: 0,
            },
        );
        info!("registered schedule {name} every {interval_ms} ms");
    }

    /// Arm a schedule; the first fire is one interval from now.
    pub async fn start(&self, name: &str) -> DiagResult<()> {
        let mut schedules = self.schedules.lock().await;
        let schedule = schedules
            .get_mut(name)
            .ok_or_else(|| DiagError::UnknownSchedule(name.to_string()))?;
        schedule.started = true;
        schedule.next_run = Some(types::now_ms() + schedule.interval_ms);
        Ok(())
    }

    pub async fn stop(&self, name: &str) -> DiagResult<()> {
        let mut schedules = self.schedules.lock().await;
        let schedule = schedules
            .get_mut(name)
            .ok_or_else(|| DiagError::UnknownSchedule(name.to_string()))?;
        schedule.started = false;
        schedule.next_run = None;
        Ok(())
    }

    pub async fn status(&self) -> Vec<ScheduleStatus> {
        let schedules = self.schedules.lock().await;
        let mut out: Vec<ScheduleStatus> = schedules
            .iter()
            .map(|(name, s)| ScheduleStatus {
                name: name.clone(),
                interval_ms: s.interval_ms,
                running: s.running.try_lock().is_err(),
                started: s.started,
                last_run: s.last_run,
                next_run: s.next_run,
                run_count: s.run_count,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Fire every due schedule. Called from the service loop on a short
    /// tick; each job runs detached so one slow probe cannot stall the
    /// scheduler.
    pub async fn fire_due(&self, now_ms: i64) {
        let mut schedules = self.schedules.lock().await;
        for (name, schedule) in schedules.iter_mut() {
            if !schedule.started {
                continue;
            }
            let due = schedule.next_run.is_some_and(|next| next <= now_ms);
            if !due {
                continue;
            }

            // Overlap means the missed fire is skipped, not queued.
            let Ok(guard) = schedule.running.clone().try_lock_owned() else {
                debug!("schedule {name} still running, skipping fire");
                schedule.next_run = Some(now_ms + schedule.interval_ms);
                continue;
            };

            schedule.last_run = Some(now_ms);
            schedule.next_run = Some(now_ms + schedule.interval_ms);
            schedule.run_count += 1;

            let job = schedule.job.clone();
            let name = name.clone();
            tokio::spawn(async move {
                let _guard = guard;
                debug!("schedule {name} firing");
                job().await;
            });
        }
        drop(schedules);
    }

    /// Arm every registered schedule.
    pub async fn start_all(&self) {
        let names: Vec<String> = self.schedules.lock().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.start(&name).await {
                warn!("failed to start schedule {name}: {e}");
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn fires_after_interval_and_counts_runs() {
        let scheduler = Scheduler::new();
        let hits = Arc::new(AtomicU32::new(0));
        let hits_clone = hits.clone();
        scheduler
            .register("tick", 100, move || {
                let hits = hits_clone.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;
        scheduler.start("tick").await.unwrap();

        let now = types::now_ms();
        // Not yet due.
        scheduler.fire_due(now).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        scheduler.fire_due(now + 150).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let status = &scheduler.status().await[0];
        assert_eq!(status.run_count, 1);
        assert!(status.last_run.is_some());
        assert!(status.next_run.unwrap() > now + 150);
    }

    #[tokio::test]
    async fn overlapping_fire_is_skipped() {
        let scheduler = Scheduler::new();
        let hits = Arc::new(AtomicU32::new(0));
        let hits_clone = hits.clone();
        scheduler
            .register("slow", 50, move || {
                let hits = hits_clone.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            })
            .await;
        scheduler.start("slow").await.unwrap();

        let now = types::now_ms();
        scheduler.fire_due(now + 60).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Second fire lands while the first is still sleeping.
        scheduler.fire_due(now + 120).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // The skip still pushed next_run forward.
        let status = &scheduler.status().await[0];
        assert_eq!(status.run_count, 1);
    }

    #[tokio::test]
    async fn unknown_schedule_errors() {
        let scheduler = Scheduler::new();
        assert!(matches!(
            scheduler.start("missing").await,
            Err(DiagError::UnknownSchedule(_))
        ));
    }
}
