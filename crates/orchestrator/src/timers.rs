//! Persistent timer queue.
//!
//! Timers live in the store so a crash mid-invoice cannot leak a session or
//! let a payment wait forever. The tick is coarse (1 s); handlers are
//! idempotent, so a timer that fires twice across a crash boundary is
//! harmless.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use subpilot_core::jobs::TimerType;

use crate::db::{Db, DueTimer};

/// Scheduling handle over the persistent timer table. Cheap to clone.
#[derive(Clone)]
pub struct Timers {
    db: Db,
}

impl Timers {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Schedule a timer `delay` from now. Supersedes any unfired timer with
    /// the same `(type, target)` key.
    pub async fn schedule_delay(
        &self,
        timer_type: TimerType,
        target_id: &str,
        delay: Duration,
    ) -> anyhow::Result<()> {
        let fire_at = Utc::now().timestamp() + delay.as_secs() as i64;
        self.db.schedule_timer(timer_type, target_id, fire_at).await
    }

    /// Schedule a timer at an absolute unix second.
    pub async fn schedule_at(
        &self,
        timer_type: TimerType,
        target_id: &str,
        fire_at: i64,
    ) -> anyhow::Result<()> {
        self.db.schedule_timer(timer_type, target_id, fire_at).await
    }

    /// Cancel the unfired timer with this key, if any.
    pub async fn cancel(&self, timer_type: TimerType, target_id: &str) -> anyhow::Result<()> {
        self.db.cancel_timer(timer_type, target_id).await
    }

    /// Cancel every unfired timer for this target, across all types.
    pub async fn cancel_all(&self, target_id: &str) -> anyhow::Result<()> {
        self.db.cancel_timers_for(target_id).await
    }
}

/// Run the timer tick until the channel closes: every `tick`, mark due
/// timers fired and push them to `tx` in fire order.
pub async fn run_tick(db: Db, tx: mpsc::Sender<DueTimer>, tick: Duration) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        let due = match db.due_timers(Utc::now().timestamp()).await {
            Ok(due) => due,
            Err(err) => {
                tracing::error!("timer scan failed: {err:#}");
                continue;
            }
        };
        for timer in due {
            if tx.send(timer).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delay_schedules_in_the_future() {
        let db = Db::open_in_memory().unwrap();
        let timers = Timers::new(db.clone());
        timers
            .schedule_delay(TimerType::PaymentExpiry, "job-1", Duration::from_secs(3600))
            .await
            .unwrap();

        // Not due now.
        assert!(db.due_timers(Utc::now().timestamp()).await.unwrap().is_empty());
        // Due an hour from now.
        let due = db
            .due_timers(Utc::now().timestamp() + 3601)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].timer_type, TimerType::PaymentExpiry);
    }

    #[tokio::test]
    async fn tick_delivers_due_timers() {
        let db = Db::open_in_memory().unwrap();
        let timers = Timers::new(db.clone());
        timers
            .schedule_at(TimerType::Outreach, "job-1", Utc::now().timestamp() - 1)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let tick = tokio::spawn(run_tick(db, tx, Duration::from_millis(10)));

        let fired = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("tick should deliver")
            .expect("channel open");
        assert_eq!(fired.timer_type, TimerType::Outreach);
        assert_eq!(fired.target_id, "job-1");

        tick.abort();
    }
}
