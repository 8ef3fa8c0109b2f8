//! In-process trigger table

use super::{Job, Scheduler};
use crate::store::{TokenStore, TokenStoreExt};
use crate::{MirrorError, Result};
use chrono::{DateTime, Days, Duration as ChronoDuration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Store key holding the persisted trigger table
const TRIGGERS_KEY: &str = "scheduler/triggers";

/// When a trigger fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerKind {
    Once {
        at: DateTime<Utc>,
    },
    Daily {
        at_hour: u32,
        every_n_days: u32,
        next: DateTime<Utc>,
    },
    CalendarChange {
        calendar_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub job: Job,
    #[serde(flatten)]
    pub kind: TriggerKind,
}

/// First `at_hour:00` UTC strictly after `now + (every_n_days - 1)` days
fn first_daily_run(now: DateTime<Utc>, at_hour: u32, every_n_days: u32) -> Option<DateTime<Utc>> {
    let base = now.checked_add_days(Days::new(u64::from(every_n_days.saturating_sub(1))))?;
    let candidate = base
        .with_hour(at_hour)?
        .with_minute(0)?
        .with_second(0)?
        .with_nanosecond(0)?;
    if candidate > base {
        Some(candidate)
    } else {
        candidate.checked_add_days(Days::new(1))
    }
}

/// Trigger table kept in memory and optionally mirrored into a [`TokenStore`]
///
/// Persisting the table keeps trigger ids referenced by a saved subscription
/// valid across restarts.
pub struct LocalScheduler {
    triggers: Mutex<BTreeMap<String, Trigger>>,
    store: Option<Arc<dyn TokenStore>>,
}

impl Default for LocalScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalScheduler {
    /// Scheduler whose triggers live only as long as the process
    pub fn new() -> Self {
        Self {
            triggers: Mutex::new(BTreeMap::new()),
            store: None,
        }
    }

    /// Scheduler that loads and saves its triggers through `store`
    pub fn persistent(store: Arc<dyn TokenStore>) -> Result<Self> {
        let saved: Vec<Trigger> = store.get_json(TRIGGERS_KEY)?.unwrap_or_default();
        let triggers = saved.into_iter().map(|t| (t.id.clone(), t)).collect();
        Ok(Self {
            triggers: Mutex::new(triggers),
            store: Some(store),
        })
    }

    fn table(&self) -> MutexGuard<'_, BTreeMap<String, Trigger>> {
        self.triggers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save(&self, table: &BTreeMap<String, Trigger>) -> Result<()> {
        if let Some(store) = &self.store {
            let triggers: Vec<&Trigger> = table.values().collect();
            store.set_json(TRIGGERS_KEY, &triggers)?;
        }
        Ok(())
    }

    fn add(&self, job: Job, kind: TriggerKind) -> Result<String> {
        let trigger = Trigger {
            id: uuid::Uuid::new_v4().to_string(),
            job,
            kind,
        };
        let id = trigger.id.clone();
        debug!(trigger_id = %id, job = %job, kind = ?trigger.kind, "Scheduled trigger");

        let mut table = self.table();
        table.insert(id.clone(), trigger);
        if let Err(e) = self.save(&table) {
            // An unsaved trigger must not fire
            table.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Every registered trigger, ordered by id
    pub fn triggers(&self) -> Vec<Trigger> {
        self.table().values().cloned().collect()
    }

    pub fn get(&self, trigger_id: &str) -> Option<Trigger> {
        self.table().get(trigger_id).cloned()
    }

    /// Jobs whose time has come
    ///
    /// One-shot triggers are removed; daily triggers move to their next run
    /// after `now`.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<(String, Job)>> {
        let mut table = self.table();
        let mut fired = Vec::new();
        let mut finished = Vec::new();

        for trigger in table.values_mut() {
            match &mut trigger.kind {
                TriggerKind::Once { at } if *at <= now => {
                    fired.push((trigger.id.clone(), trigger.job));
                    finished.push(trigger.id.clone());
                }
                TriggerKind::Daily {
                    every_n_days, next, ..
                } if *next <= now => {
                    fired.push((trigger.id.clone(), trigger.job));
                    let step = Days::new(u64::from((*every_n_days).max(1)));
                    while *next <= now {
                        *next = next.checked_add_days(step).ok_or_else(|| {
                            MirrorError::Other("Daily trigger moved past the end of time".into())
                        })?;
                    }
                }
                _ => {}
            }
        }

        for id in finished {
            table.remove(&id);
        }
        if !fired.is_empty() {
            self.save(&table)?;
        }
        Ok(fired)
    }

    /// Jobs registered for changes on `calendar_id`
    pub fn calendar_changed(&self, calendar_id: &str) -> Vec<(String, Job)> {
        self.table()
            .values()
            .filter(|t| matches!(&t.kind, TriggerKind::CalendarChange { calendar_id: c } if c == calendar_id))
            .map(|t| (t.id.clone(), t.job))
            .collect()
    }

    /// Calendars that have change triggers
    pub fn watched_calendars(&self) -> Vec<String> {
        let mut calendars: Vec<String> = self
            .table()
            .values()
            .filter_map(|t| match &t.kind {
                TriggerKind::CalendarChange { calendar_id } => Some(calendar_id.clone()),
                _ => None,
            })
            .collect();
        calendars.sort();
        calendars.dedup();
        calendars
    }
}

impl Scheduler for LocalScheduler {
    fn schedule_once(&self, delay: Duration, job: Job) -> Result<String> {
        let delay = ChronoDuration::from_std(delay)
            .map_err(|e| MirrorError::Config(format!("Invalid trigger delay: {}", e)))?;
        self.add(job, TriggerKind::Once { at: Utc::now() + delay })
    }

    fn schedule_recurring_daily(&self, at_hour: u32, every_n_days: u32, job: Job) -> Result<String> {
        if at_hour > 23 {
            return Err(MirrorError::Config(format!("Invalid trigger hour: {}", at_hour)));
        }
        if every_n_days == 0 {
            return Err(MirrorError::Config("Daily trigger interval must be at least one day".into()));
        }
        let next = first_daily_run(Utc::now(), at_hour, every_n_days)
            .ok_or_else(|| MirrorError::Config("Daily trigger time out of range".into()))?;
        self.add(
            job,
            TriggerKind::Daily {
                at_hour,
                every_n_days,
                next,
            },
        )
    }

    fn schedule_on_calendar_change(&self, calendar_id: &str, job: Job) -> Result<String> {
        if calendar_id.trim().is_empty() {
            return Err(MirrorError::Config("Calendar id is required for a change trigger".into()));
        }
        self.add(
            job,
            TriggerKind::CalendarChange {
                calendar_id: calendar_id.to_string(),
            },
        )
    }

    fn cancel(&self, trigger_id: &str) -> Result<bool> {
        let mut table = self.table();
        let Some(removed) = table.remove(trigger_id) else {
            return Ok(false);
        };
        if let Err(e) = self.save(&table) {
            table.insert(removed.id.clone(), removed);
            return Err(e);
        }
        debug!(trigger_id = %trigger_id, "Cancelled trigger");
        Ok(true)
    }

    fn exists(&self, trigger_id: &str) -> Result<bool> {
        Ok(self.table().contains_key(trigger_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FlakyTokenStore, MemoryTokenStore};
    use chrono::TimeZone;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_first_daily_run_is_strictly_after_offset() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 15, 30, 0).unwrap();
        assert_eq!(
            first_daily_run(now, 0, 1),
            Some(Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap())
        );
        assert_eq!(
            first_daily_run(now, 0, 6),
            Some(Utc.with_ymd_and_hms(2024, 3, 16, 0, 0, 0).unwrap())
        );
        assert_eq!(
            first_daily_run(now, 18, 1),
            Some(Utc.with_ymd_and_hms(2024, 3, 10, 18, 0, 0).unwrap())
        );

        let midnight = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        assert_eq!(
            first_daily_run(midnight, 0, 1),
            Some(Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_one_shot_fires_once() {
        let scheduler = LocalScheduler::new();
        let id = scheduler
            .schedule_once(Duration::from_secs(60), Job::FlushJournal)
            .unwrap();

        assert!(scheduler.due(Utc::now()).unwrap().is_empty());

        let later = Utc::now() + ChronoDuration::seconds(120);
        assert_eq!(scheduler.due(later).unwrap(), vec![(id.clone(), Job::FlushJournal)]);
        assert!(scheduler.due(later).unwrap().is_empty());
        assert!(!scheduler.exists(&id).unwrap());
    }

    #[test]
    fn test_daily_trigger_advances_by_interval() {
        let scheduler = LocalScheduler::new();
        let id = scheduler
            .schedule_recurring_daily(0, 6, Job::RenewSubscription)
            .unwrap();
        let first = match scheduler.get(&id).unwrap().kind {
            TriggerKind::Daily { next, .. } => next,
            other => panic!("unexpected trigger {:?}", other),
        };

        assert_eq!(scheduler.due(first).unwrap(), vec![(id.clone(), Job::RenewSubscription)]);
        match scheduler.get(&id).unwrap().kind {
            TriggerKind::Daily { next, .. } => assert_eq!(next, first + ChronoDuration::days(6)),
            other => panic!("unexpected trigger {:?}", other),
        }
        assert!(scheduler.exists(&id).unwrap());
    }

    #[test]
    fn test_invalid_daily_parameters_are_rejected() {
        let scheduler = LocalScheduler::new();
        assert!(scheduler.schedule_recurring_daily(24, 1, Job::RenewSubscription).is_err());
        assert!(scheduler.schedule_recurring_daily(0, 0, Job::RenewSubscription).is_err());
        assert!(scheduler.triggers().is_empty());
    }

    #[test]
    fn test_calendar_change_triggers() {
        let scheduler = LocalScheduler::new();
        let id = scheduler
            .schedule_on_calendar_change("src", Job::SyncCalendars)
            .unwrap();

        assert_eq!(scheduler.calendar_changed("src"), vec![(id.clone(), Job::SyncCalendars)]);
        assert!(scheduler.calendar_changed("other").is_empty());
        assert_eq!(scheduler.watched_calendars(), vec!["src".to_string()]);
        assert!(scheduler.due(Utc::now() + ChronoDuration::days(30)).unwrap().is_empty());

        assert!(scheduler.cancel(&id).unwrap());
        assert!(!scheduler.cancel(&id).unwrap());
    }

    #[test]
    fn test_persistent_triggers_survive_reload() {
        let store: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::new());
        let id = {
            let scheduler = LocalScheduler::persistent(store.clone()).unwrap();
            scheduler
                .schedule_on_calendar_change("src", Job::SyncCalendars)
                .unwrap()
        };

        let reloaded = LocalScheduler::persistent(store).unwrap();
        assert!(reloaded.exists(&id).unwrap());
        assert_eq!(reloaded.triggers().len(), 1);
    }

    #[test]
    fn test_unsaved_trigger_is_not_kept() {
        let store = Arc::new(FlakyTokenStore::new());
        let scheduler = LocalScheduler::persistent(store.clone()).unwrap();
        store.fail_writes.store(true, Ordering::SeqCst);

        let err = scheduler
            .schedule_once(Duration::from_secs(60), Job::RenewSubscription)
            .unwrap_err();
        assert!(matches!(err, MirrorError::Storage(_)));
        assert!(scheduler.triggers().is_empty());
        assert!(scheduler
            .due(Utc::now() + ChronoDuration::days(1))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_unsaved_cancel_keeps_trigger() {
        let store = Arc::new(FlakyTokenStore::new());
        let scheduler = LocalScheduler::persistent(store.clone()).unwrap();
        let id = scheduler
            .schedule_on_calendar_change("src", Job::SyncCalendars)
            .unwrap();
        store.fail_writes.store(true, Ordering::SeqCst);

        assert!(scheduler.cancel(&id).is_err());
        assert!(scheduler.exists(&id).unwrap());

        store.fail_writes.store(false, Ordering::SeqCst);
        assert!(scheduler.cancel(&id).unwrap());
        let reloaded = LocalScheduler::persistent(store).unwrap();
        assert!(reloaded.triggers().is_empty());
    }
}
