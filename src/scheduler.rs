use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

use crate::clock::SimClock;
use crate::persona::{ActiveWindow, Persona, Schedule};

/// One planned dial-in, consumed exactly once by the session pool.
#[derive(Debug, Clone)]
pub struct ScheduledSession {
    pub handle: String,
    pub persona: Arc<Persona>,
    pub scheduled_sim_time: DateTime<Utc>,
}

/// Personas without an explicit schedule still get evenings on the board.
fn default_schedule() -> Schedule {
    Schedule {
        active_hours: vec![ActiveWindow { start: 18, end: 23, weight: 1.0 }],
        sessions_per_day: 2,
        min_gap_minutes: 60,
        jitter_minutes: 30,
        active_days: None,
    }
}

/// Slot minutes-from-midnight for one persona on one day. Pure; the run
/// loop feeds it the sim date and an RNG.
fn plan_persona_day<R: Rng>(schedule: &Schedule, weekday: u32, rng: &mut R) -> Vec<f64> {
    if let Some(days) = &schedule.active_days {
        if !days.contains(&weekday) {
            return Vec::new();
        }
    }

    // windows as (start_min, end_min, weight), wrapping past midnight
    let windows: Vec<(f64, f64, f64)> = schedule
        .active_hours
        .iter()
        .map(|w| {
            let start = (w.start * 60) as f64;
            let mut end = (w.end * 60) as f64;
            if end <= start {
                end += 24.0 * 60.0;
            }
            (start, end, w.weight)
        })
        .collect();

    let total_weighted: f64 = windows.iter().map(|(s, e, w)| (e - s) * w).sum();
    if total_weighted <= 0.0 {
        return Vec::new();
    }

    let per_day = schedule.sessions_per_day as i64;
    let mut remaining = per_day;
    let mut slots = Vec::new();

    for (idx, (start, end, weight)) in windows.iter().enumerate() {
        let minutes = end - start;
        let share = per_day as f64 * (minutes * weight / total_weighted);
        let mut count = (share.round() as i64).min(remaining);
        if idx == windows.len() - 1 {
            count = remaining; // leftover lands in the last window
        }
        remaining -= count;

        let gap = minutes / (count + 1) as f64;
        for i in 1..=count {
            let mut slot = start + gap * i as f64;
            if schedule.jitter_minutes > 0 {
                let jitter = schedule.jitter_minutes as f64;
                slot += rng.gen_range(-jitter..=jitter);
            }
            slots.push(slot.clamp(*start, *end));
        }
    }

    slots.sort_by(|a, b| a.partial_cmp(b).unwrap());

    // enforce the per-persona spacing by pushing violators forward
    let min_gap = schedule.min_gap_minutes as f64;
    for i in 1..slots.len() {
        if slots[i] < slots[i - 1] + min_gap {
            slots[i] = slots[i - 1] + min_gap;
        }
    }

    slots
}

/// The merged plan for one simulated day, sorted by time ascending.
pub fn build_day_plan<R: Rng>(
    personas: &[Arc<Persona>],
    day: NaiveDate,
    rng: &mut R,
) -> Vec<ScheduledSession> {
    let weekday = day.weekday().num_days_from_sunday();
    let midnight = Utc
        .from_utc_datetime(&day.and_hms_opt(0, 0, 0).expect("midnight exists"));

    let mut plan = Vec::new();
    for persona in personas {
        let default;
        let schedule = match &persona.schedule {
            Some(s) => s,
            None => {
                default = default_schedule();
                &default
            }
        };

        for minutes in plan_persona_day(schedule, weekday, rng) {
            plan.push(ScheduledSession {
                handle: persona.handle.clone(),
                persona: persona.clone(),
                scheduled_sim_time: midnight + Duration::seconds((minutes * 60.0) as i64),
            });
        }
    }

    plan.sort_by_key(|s| s.scheduled_sim_time);
    plan
}

/// Generates per-day plans from persona schedules and emits each session at
/// its sim time. Runs until `stop()`.
pub struct SessionScheduler {
    personas: Vec<Arc<Persona>>,
    clock: SimClock,
    stopped: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    last_session_time: HashMap<String, DateTime<Utc>>,
}

impl SessionScheduler {
    pub fn new(personas: Vec<Arc<Persona>>, clock: SimClock) -> Self {
        SessionScheduler {
            personas,
            clock,
            stopped: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
            last_session_time: HashMap::new(),
        }
    }

    /// A handle that stops the run loop from outside.
    pub fn stop_handle(&self) -> SchedulerStop {
        SchedulerStop {
            stopped: self.stopped.clone(),
            notify: self.stop_notify.clone(),
        }
    }

    pub async fn run(mut self, due_tx: mpsc::UnboundedSender<ScheduledSession>) {
        let mut rng = rand::rngs::StdRng::from_entropy();
        let mut plan: Vec<ScheduledSession> = Vec::new();
        let mut plan_day: Option<NaiveDate> = None;

        info!(personas = self.personas.len(), "scheduler running");

        while !self.stopped.load(Ordering::SeqCst) {
            if self.clock.is_paused() {
                self.clock.wait_for_resume().await;
                continue;
            }

            let now = self.clock.now();
            let today = now.date_naive();
            if plan_day != Some(today) {
                plan = build_day_plan(&self.personas, today, &mut rng);
                plan_day = Some(today);
                debug!(day = %today, sessions = plan.len(), "day plan generated");
            }

            // inclusive: in turbo mode now() can sit exactly on a slot
            let next_idx = plan.iter().position(|s| s.scheduled_sim_time >= now);
            let Some(idx) = next_idx else {
                let tomorrow = Utc.from_utc_datetime(
                    &(today + Duration::days(1)).and_hms_opt(0, 0, 0).expect("midnight exists"),
                );
                if self.wait_or_stop(tomorrow).await {
                    break;
                }
                continue;
            };

            let next = plan[idx].clone();
            if self.wait_or_stop(next.scheduled_sim_time).await {
                break;
            }
            if self.clock.is_paused() {
                continue;
            }

            plan.remove(idx);
            self.last_session_time
                .insert(next.handle.clone(), next.scheduled_sim_time);
            debug!(handle = %next.handle, at = %next.scheduled_sim_time, "session due");
            if due_tx.send(next).is_err() {
                break; // pool went away
            }

            // let the pool pick the session up before planning the next one
            tokio::task::yield_now().await;
        }

        info!("scheduler stopped");
    }

    /// Returns true if stopped while waiting.
    async fn wait_or_stop(&self, target: DateTime<Utc>) -> bool {
        tokio::select! {
            _ = self.clock.wait_until(target) => self.stopped.load(Ordering::SeqCst),
            _ = self.stop_notify.notified() => true,
        }
    }
}

#[derive(Clone)]
pub struct SchedulerStop {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl SchedulerStop {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}
