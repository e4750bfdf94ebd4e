//! Cron service for scheduled triggers.
//!
//! Wraps `tokio-cron-scheduler` with schedule-string normalization
//! ("every 5 minutes" and friends become 6-field cron expressions) and
//! missed-run detection so a restart can catch up on ticks that fell
//! into the downtime window.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("cron job error: {0}")]
    Job(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("definition {0} has no scheduled trigger registered")]
    NotScheduled(Uuid),
}

// ---------------------------------------------------------------------------
// Schedule normalization
// ---------------------------------------------------------------------------

/// Normalize a schedule string to a 6-field cron expression.
///
/// Accepts standard cron (5-field gets a seconds column prepended,
/// 6-field passes through) and a small human-readable vocabulary:
/// "every N seconds/minutes/hours", "every minute/hour/day",
/// "minutely"/"hourly"/"daily", and "every day at HH:MM".
pub fn normalize_schedule(input: &str) -> Result<String, CronError> {
    let trimmed = input.trim();

    let fields = trimmed.split_whitespace().count();
    if fields == 5 {
        return Ok(format!("0 {trimmed}"));
    }
    if fields == 6 {
        return Ok(trimmed.to_string());
    }

    let lower = trimmed.to_lowercase();
    match lower.as_str() {
        "every minute" | "minutely" => return Ok("0 * * * * *".to_string()),
        "every hour" | "hourly" => return Ok("0 0 * * * *".to_string()),
        "every day" | "daily" => return Ok("0 0 0 * * *".to_string()),
        _ => {}
    }

    if let Some(rest) = lower.strip_prefix("every ") {
        if let Some(clock) = rest.strip_prefix("day at ") {
            if let Some((h, m)) = clock.split_once(':') {
                let hour: u32 = h
                    .trim()
                    .parse()
                    .map_err(|_| CronError::InvalidSchedule(input.to_string()))?;
                let minute: u32 = m
                    .trim()
                    .parse()
                    .map_err(|_| CronError::InvalidSchedule(input.to_string()))?;
                if hour < 24 && minute < 60 {
                    return Ok(format!("0 {minute} {hour} * * *"));
                }
            }
            return Err(CronError::InvalidSchedule(input.to_string()));
        }

        let words: Vec<&str> = rest.split_whitespace().collect();
        if let [count, unit] = words.as_slice() {
            let n: u32 = count
                .parse()
                .map_err(|_| CronError::InvalidSchedule(input.to_string()))?;
            if n == 0 {
                return Err(CronError::InvalidSchedule(
                    "interval must be greater than zero".to_string(),
                ));
            }
            return match unit.trim_end_matches('s') {
                "second" => Ok(format!("*/{n} * * * * *")),
                "minute" => Ok(format!("0 */{n} * * * *")),
                "hour" => Ok(format!("0 0 */{n} * * *")),
                _ => Err(CronError::InvalidSchedule(input.to_string())),
            };
        }
    }

    Err(CronError::InvalidSchedule(format!(
        "unrecognized schedule format: '{trimmed}'"
    )))
}

// ---------------------------------------------------------------------------
// Cron service
// ---------------------------------------------------------------------------

/// Invoked with the definition id and fire time on every tick.
pub type TickCallback =
    Arc<dyn Fn(Uuid, DateTime<Utc>) -> futures_util::future::BoxFuture<'static, ()> + Send + Sync>;

struct ScheduledEntry {
    job_id: Uuid,
    trigger_name: String,
    cron_expr: String,
    last_fired: Option<DateTime<Utc>>,
}

/// Lifecycle owner for scheduled triggers.
#[derive(Clone)]
pub struct CronService {
    inner: Arc<RwLock<Option<JobScheduler>>>,
    entries: Arc<RwLock<HashMap<Uuid, ScheduledEntry>>>,
}

impl CronService {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start the underlying job scheduler. Required before `schedule`.
    pub async fn start(&self) -> Result<(), CronError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| CronError::Job(e.to_string()))?;
        scheduler
            .start()
            .await
            .map_err(|e| CronError::Job(e.to_string()))?;
        *self.inner.write().await = Some(scheduler);
        tracing::info!("cron service started");
        Ok(())
    }

    /// Shut down and drop all jobs.
    pub async fn stop(&self) -> Result<(), CronError> {
        if let Some(mut scheduler) = self.inner.write().await.take() {
            scheduler
                .shutdown()
                .await
                .map_err(|e| CronError::Job(e.to_string()))?;
            tracing::info!("cron service stopped");
        }
        self.entries.write().await.clear();
        Ok(())
    }

    /// Register a scheduled trigger for a definition. The schedule may
    /// be cron or human-readable; `callback` fires on every tick.
    pub async fn schedule(
        &self,
        definition_id: Uuid,
        trigger_name: &str,
        schedule: &str,
        callback: TickCallback,
    ) -> Result<(), CronError> {
        let cron_expr = normalize_schedule(schedule)?;

        let inner = self.inner.read().await;
        let scheduler = inner
            .as_ref()
            .ok_or_else(|| CronError::Job("cron service not started".to_string()))?;

        let service = self.clone();
        let job = Job::new_async(cron_expr.as_str(), move |_job_id, _lock| {
            let cb = callback.clone();
            let service = service.clone();
            Box::pin(async move {
                let now = Utc::now();
                tracing::debug!(%definition_id, %now, "scheduled trigger fired");
                service.record_fire(definition_id).await;
                cb(definition_id, now).await;
            })
        })
        .map_err(|e| CronError::InvalidSchedule(e.to_string()))?;

        let job_id = job.guid();
        scheduler
            .add(job)
            .await
            .map_err(|e| CronError::Job(e.to_string()))?;

        self.entries.write().await.insert(
            definition_id,
            ScheduledEntry {
                job_id,
                trigger_name: trigger_name.to_string(),
                cron_expr,
                last_fired: None,
            },
        );

        tracing::info!(%definition_id, trigger_name, %job_id, "scheduled trigger registered");
        Ok(())
    }

    /// Drop the scheduled trigger for a definition.
    pub async fn unschedule(&self, definition_id: Uuid) -> Result<(), CronError> {
        let entry = self
            .entries
            .write()
            .await
            .remove(&definition_id)
            .ok_or(CronError::NotScheduled(definition_id))?;

        if let Some(scheduler) = self.inner.read().await.as_ref() {
            scheduler
                .remove(&entry.job_id)
                .await
                .map_err(|e| CronError::Job(e.to_string()))?;
        }
        tracing::info!(%definition_id, trigger_name = %entry.trigger_name, "scheduled trigger removed");
        Ok(())
    }

    /// Update the last-fired baseline used for missed-run detection.
    /// Called by the job closure on every tick.
    pub async fn record_fire(&self, definition_id: Uuid) {
        if let Some(entry) = self.entries.write().await.get_mut(&definition_id) {
            entry.last_fired = Some(Utc::now());
        }
    }

    /// Seed the last-fired baseline from durable history, typically the
    /// newest persisted scheduled start. A baseline recorded by a live
    /// tick in this process wins over the seed.
    pub async fn seed_baseline(&self, definition_id: Uuid, at: DateTime<Utc>) {
        if let Some(entry) = self.entries.write().await.get_mut(&definition_id)
            && entry.last_fired.is_none()
        {
            entry.last_fired = Some(at);
        }
    }

    /// Trigger name registered for a definition, if any.
    pub async fn trigger_name(&self, definition_id: Uuid) -> Option<String> {
        self.entries
            .read()
            .await
            .get(&definition_id)
            .map(|e| e.trigger_name.clone())
    }

    pub async fn scheduled_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Compute ticks that should have fired between each baseline and
    /// now. `schedules` carries (definition id, schedule string,
    /// last-fired baseline); entries without a baseline are skipped.
    pub fn check_missed_runs(
        &self,
        schedules: &[(Uuid, String, Option<DateTime<Utc>>)],
    ) -> Vec<(Uuid, Vec<DateTime<Utc>>)> {
        let now = Utc::now();
        let mut missed = Vec::new();

        for (definition_id, schedule, last_fired) in schedules {
            let Ok(cron_expr) = normalize_schedule(schedule) else {
                continue;
            };
            let Ok(cron) = cron_expr.parse::<croner::Cron>() else {
                continue;
            };
            let Some(from) = last_fired else {
                continue;
            };

            let mut times = Vec::new();
            for next in cron.iter_after(*from) {
                if next >= now {
                    break;
                }
                times.push(next);
            }
            if !times.is_empty() {
                tracing::warn!(%definition_id, count = times.len(), "detected missed scheduled runs");
                missed.push((*definition_id, times));
            }
        }

        missed
    }

    /// Snapshot of `(definition_id, cron expression, last fired)` for
    /// persistence or diagnostics.
    pub async fn snapshot(&self) -> Vec<(Uuid, String, Option<DateTime<Utc>>)> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(id, e)| (*id, e.cron_expr.clone(), e.last_fired))
            .collect()
    }
}

impl Default for CronService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    // -- normalize_schedule -------------------------------------------------

    #[test]
    fn five_field_cron_gains_seconds() {
        assert_eq!(normalize_schedule("*/5 * * * *").unwrap(), "0 */5 * * * *");
    }

    #[test]
    fn six_field_cron_passes_through() {
        assert_eq!(
            normalize_schedule("30 */5 * * * *").unwrap(),
            "30 */5 * * * *"
        );
    }

    #[test]
    fn interval_vocabulary() {
        assert_eq!(
            normalize_schedule("every 5 minutes").unwrap(),
            "0 */5 * * * *"
        );
        assert_eq!(
            normalize_schedule("every 10 seconds").unwrap(),
            "*/10 * * * * *"
        );
        assert_eq!(normalize_schedule("every 2 hours").unwrap(), "0 0 */2 * * *");
        assert_eq!(normalize_schedule("every 1 minute").unwrap(), "0 */1 * * * *");
    }

    #[test]
    fn keyword_vocabulary() {
        assert_eq!(normalize_schedule("every minute").unwrap(), "0 * * * * *");
        assert_eq!(normalize_schedule("hourly").unwrap(), "0 0 * * * *");
        assert_eq!(normalize_schedule("daily").unwrap(), "0 0 0 * * *");
        assert_eq!(
            normalize_schedule("Every 5 Minutes").unwrap(),
            "0 */5 * * * *"
        );
    }

    #[test]
    fn day_at_clock_time() {
        assert_eq!(
            normalize_schedule("every day at 09:30").unwrap(),
            "0 30 9 * * *"
        );
        assert_eq!(
            normalize_schedule("every day at 00:00").unwrap(),
            "0 0 0 * * *"
        );
        assert!(normalize_schedule("every day at 25:00").is_err());
    }

    #[test]
    fn rejects_nonsense_and_zero_intervals() {
        assert!(normalize_schedule("run whenever").is_err());
        assert!(normalize_schedule("every 0 minutes").is_err());
    }

    // -- missed runs --------------------------------------------------------

    #[test]
    fn missed_runs_detected_from_baseline() {
        let service = CronService::new();
        let id = Uuid::now_v7();
        let last = Utc::now() - Duration::minutes(10);
        let missed =
            service.check_missed_runs(&[(id, "every minute".to_string(), Some(last))]);
        assert_eq!(missed.len(), 1);
        let count = missed[0].1.len();
        assert!((8..=10).contains(&count), "expected 8-10 misses, got {count}");
    }

    #[test]
    fn no_baseline_means_no_misses() {
        let service = CronService::new();
        let missed =
            service.check_missed_runs(&[(Uuid::now_v7(), "every minute".to_string(), None)]);
        assert!(missed.is_empty());
    }

    #[test]
    fn fresh_baseline_has_no_misses() {
        let service = CronService::new();
        let last = Utc::now() - Duration::seconds(5);
        let missed = service.check_missed_runs(&[(
            Uuid::now_v7(),
            "every hour".to_string(),
            Some(last),
        )]);
        assert!(missed.is_empty());
    }

    #[test]
    fn invalid_schedules_are_skipped() {
        let service = CronService::new();
        let last = Utc::now() - Duration::hours(1);
        let missed = service.check_missed_runs(&[(
            Uuid::now_v7(),
            "not a schedule".to_string(),
            Some(last),
        )]);
        assert!(missed.is_empty());
    }

    // -- lifecycle ----------------------------------------------------------

    #[tokio::test]
    async fn schedule_and_unschedule_roundtrip() {
        let service = CronService::new();
        service.start().await.unwrap();

        let id = Uuid::now_v7();
        let cb: TickCallback = Arc::new(|_id, _at| Box::pin(async {}));
        service
            .schedule(id, "nightly-sync", "every 5 minutes", cb)
            .await
            .unwrap();
        assert_eq!(service.scheduled_count().await, 1);

        service.unschedule(id).await.unwrap();
        assert_eq!(service.scheduled_count().await, 0);
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn seeded_baseline_feeds_missed_run_detection() {
        let service = CronService::new();
        service.start().await.unwrap();

        let id = Uuid::now_v7();
        let cb: TickCallback = Arc::new(|_id, _at| Box::pin(async {}));
        service
            .schedule(id, "nightly", "every minute", cb)
            .await
            .unwrap();

        let stale = Utc::now() - Duration::minutes(5);
        service.seed_baseline(id, stale).await;

        let snapshot = service.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].2, Some(stale));

        let missed = service.check_missed_runs(&snapshot);
        assert_eq!(missed.len(), 1);
        assert!(!missed[0].1.is_empty());

        // Seeding again must not move an established baseline.
        service.seed_baseline(id, Utc::now()).await;
        assert_eq!(service.snapshot().await[0].2, Some(stale));

        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn tick_records_the_fire_baseline() {
        let service = CronService::new();
        service.start().await.unwrap();

        let id = Uuid::now_v7();
        let cb: TickCallback = Arc::new(|_id, _at| Box::pin(async {}));
        service
            .schedule(id, "fast", "every 1 seconds", cb)
            .await
            .unwrap();

        for _ in 0..40 {
            if service.snapshot().await[0].2.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        assert!(
            service.snapshot().await[0].2.is_some(),
            "tick never recorded a fire baseline"
        );
        assert_eq!(service.trigger_name(id).await.as_deref(), Some("fast"));

        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn schedule_before_start_fails() {
        let service = CronService::new();
        let cb: TickCallback = Arc::new(|_id, _at| Box::pin(async {}));
        assert!(
            service
                .schedule(Uuid::now_v7(), "t", "every minute", cb)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn unschedule_unknown_fails() {
        let service = CronService::new();
        service.start().await.unwrap();
        assert!(matches!(
            service.unschedule(Uuid::now_v7()).await,
            Err(CronError::NotScheduled(_))
        ));
        service.stop().await.unwrap();
    }
}
