//! Cron scheduler for the sync sources
//!
//! Manages scheduled syncs with support for:
//! - Cron expression parsing
//! - Timezone-aware scheduling
//! - Sleep/wake detection via time-jump polling
//! - Skipping a source whose previous run is still active

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::{Config, ScheduleEntry, Schedules};
use crate::db::{JobStatus, SyncMode, SyncSource};
use crate::error::SyncError;
use crate::services;

/// Grace period for runs missed while asleep (2 hours)
const MISSED_JOB_GRACE_PERIOD_SECS: i64 = 7200;

/// Time jump threshold to detect sleep/wake (5 minutes)
const TIME_JUMP_THRESHOLD_SECS: i64 = 300;

/// Poll interval for scheduler loop (1 minute)
const POLL_INTERVAL_SECS: u64 = 60;

/// Channel buffer size for scheduler messages
const SCHEDULER_CHANNEL_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionTrigger {
    Scheduled,
    Missed,
}

/// Message sent to trigger a sync
#[derive(Debug, Clone)]
pub struct SchedulerMessage {
    pub source: SyncSource,
    pub trigger: ExecutionTrigger,
}

/// Sources with a scheduled run in flight.
#[derive(Debug, Clone, Default)]
pub struct ActiveRuns(Arc<Mutex<HashSet<SyncSource>>>);

impl ActiveRuns {
    /// Mark `source` active. False when it already was.
    pub fn try_claim(&self, source: SyncSource) -> bool {
        self.0.lock().insert(source)
    }

    pub fn release(&self, source: SyncSource) {
        self.0.lock().remove(&source);
    }

    pub fn is_active(&self, source: SyncSource) -> bool {
        self.0.lock().contains(&source)
    }
}

/// Decides when each source is due and sends it down the channel.
pub struct Scheduler {
    schedules: Schedules,
    sender: mpsc::Sender<SchedulerMessage>,
    active: ActiveRuns,
    last_runs: HashMap<SyncSource, DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(schedules: Schedules, sender: mpsc::Sender<SchedulerMessage>, active: ActiveRuns) -> Self {
        Self {
            schedules,
            sender,
            active,
            last_runs: HashMap::new(),
        }
    }

    /// Start the scheduler loop
    ///
    /// This runs until the receiving side hangs up, checking for due syncs
    /// every minute.
    pub async fn run(mut self) {
        for source in SyncSource::ALL {
            let entry = self.schedules.entry(source);
            if !entry.enabled {
                log::info!("Schedule {}: disabled", source);
                continue;
            }
            match get_next_run_time(entry) {
                Ok(next) => log::info!("Schedule {}: next run at {}", source, next.to_rfc3339()),
                Err(e) => log::warn!("Schedule {}: {}", source, e),
            }
        }

        let mut last_check = Utc::now();
        loop {
            tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)).await;
            let now = Utc::now();

            // Detect sleep: time jumped more than 5 minutes
            let time_jump = (now - last_check).num_seconds();
            let waking = time_jump > TIME_JUMP_THRESHOLD_SECS;
            if waking {
                log::info!(
                    "Detected system wake (time jumped {} seconds), checking for missed syncs",
                    time_jump
                );
            }

            if !self.check_due(now, waking).await {
                log::info!("Scheduler stopping: no receiver");
                return;
            }
            last_check = now;
        }
    }

    /// Send every source due at `now`. Returns false once the channel closes.
    async fn check_due(&mut self, now: DateTime<Utc>, waking: bool) -> bool {
        for source in SyncSource::ALL {
            let entry = self.schedules.entry(source).clone();
            if !entry.enabled {
                continue;
            }
            let last_run = self.last_runs.get(&source).copied();
            let due = if waking {
                find_missed_run(&entry, last_run, now).map(|slot| slot.map(|at| (at, ExecutionTrigger::Missed)))
            } else {
                scheduled_slot(&entry, last_run, now).map(|slot| slot.map(|at| (at, ExecutionTrigger::Scheduled)))
            };
            let (slot, trigger) = match due {
                Ok(Some(found)) => found,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("Schedule {}: {}", source, e);
                    continue;
                }
            };

            self.last_runs.insert(source, slot);
            if !self.active.try_claim(source) {
                log::info!("Schedule {}: previous run still active, skipping", source);
                continue;
            }
            if self.sender.send(SchedulerMessage { source, trigger }).await.is_err() {
                self.active.release(source);
                return false;
            }
        }
        true
    }
}

/// Parse a cron expression
pub fn parse_cron(expr: &str) -> Result<Schedule, SyncError> {
    // The cron crate expects 6 fields (with seconds), but we use 5-field format
    let full_expr = format!("0 {}", expr);

    full_expr
        .parse::<Schedule>()
        .map_err(|e| SyncError::Configuration(format!("Invalid cron expression '{}': {}", expr, e)))
}

fn parse_timezone(entry: &ScheduleEntry) -> Result<Tz, SyncError> {
    entry
        .timezone
        .parse()
        .map_err(|_| SyncError::Configuration(format!("Invalid timezone: {}", entry.timezone)))
}

/// The scheduled time `now` falls on, if it is within two minutes of one that
/// has not run yet.
pub fn scheduled_slot(
    entry: &ScheduleEntry,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, SyncError> {
    let schedule = parse_cron(&entry.cron)?;
    let tz = parse_timezone(entry)?;
    let now_local = now.with_timezone(&tz);

    let Some(next_time) = schedule.after(&(now_local - chrono::Duration::minutes(2))).next() else {
        return Ok(None);
    };
    let next_utc = next_time.with_timezone(&Utc);
    if (now - next_utc).num_seconds().abs() >= 120 {
        return Ok(None);
    }
    if let Some(last) = last_run {
        if (last - next_utc).num_seconds().abs() < 60 {
            return Ok(None); // Already ran
        }
    }
    Ok(Some(next_utc))
}

/// The earliest scheduled time within the grace period that never ran.
pub fn find_missed_run(
    entry: &ScheduleEntry,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, SyncError> {
    let schedule = parse_cron(&entry.cron)?;
    let tz = parse_timezone(entry)?;
    let grace_start = now.with_timezone(&tz) - chrono::Duration::seconds(MISSED_JOB_GRACE_PERIOD_SECS);

    for scheduled in schedule.after(&grace_start) {
        let scheduled_utc = scheduled.with_timezone(&Utc);
        if scheduled_utc > now {
            break;
        }
        if matches!(last_run, Some(last) if last >= scheduled_utc) {
            continue;
        }
        return Ok(Some(scheduled_utc));
    }
    Ok(None)
}

/// Get the next scheduled time for a source
pub fn get_next_run_time(entry: &ScheduleEntry) -> Result<DateTime<Utc>, SyncError> {
    let schedule = parse_cron(&entry.cron)?;
    let tz = parse_timezone(entry)?;
    let next = schedule
        .upcoming(tz)
        .next()
        .ok_or_else(|| SyncError::Configuration("No upcoming scheduled time".to_string()))?;
    Ok(next.with_timezone(&Utc))
}

/// Run the scheduler until interrupted, executing each due sync as an
/// incremental run on its own task.
pub async fn serve(config: Config) -> Result<(), SyncError> {
    for source in SyncSource::ALL {
        let entry = config.schedules.entry(source);
        if entry.enabled {
            parse_cron(&entry.cron)?;
            parse_timezone(entry)?;
        }
    }

    let config = Arc::new(config);
    let active = ActiveRuns::default();
    let (sender, mut receiver) = mpsc::channel(SCHEDULER_CHANNEL_SIZE);
    let scheduler = Scheduler::new(config.schedules.clone(), sender, active.clone());
    tokio::spawn(scheduler.run());

    loop {
        let message = tokio::select! {
            message = receiver.recv() => message,
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, scheduler shutting down");
                return Ok(());
            }
        };
        let Some(SchedulerMessage { source, trigger }) = message else {
            return Ok(());
        };

        log::info!("Scheduled sync {} ({:?})", source, trigger);
        let config = Arc::clone(&config);
        let active = active.clone();
        tokio::spawn(async move {
            match services::sync::trigger_sync(&config, source, SyncMode::Incremental).await {
                Ok(job) if job.status == JobStatus::Completed => {}
                Ok(job) => log::warn!("Scheduled sync {} ended {}", source, job.status.as_str()),
                Err(e) => log::error!("Scheduled sync {} not run: {}", source, e),
            }
            active.release(source);
        });
    }
}
