use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Longest single sleep inside `wait_until`; the loop re-reads speed and
/// pause state between chunks.
const SLEEP_CHUNK: Duration = Duration::from_secs(1);

/// Virtual historical time. Runs at a configurable multiple of wall clock
/// (0 = turbo), except that any live session forces realtime so keystroke
/// pacing stays human.
#[derive(Clone)]
pub struct SimClock {
    state: Arc<Mutex<ClockState>>,
    resumed: Arc<Notify>,
}

struct ClockState {
    base_sim: DateTime<Utc>,
    base_real: Instant,
    configured_speed: f64,
    active_sessions: u32,
    paused: bool,
}

impl ClockState {
    fn effective_speed(&self) -> f64 {
        if self.active_sessions > 0 {
            1.0
        } else {
            self.configured_speed
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let speed = self.effective_speed();
        if speed == 0.0 {
            return self.base_sim;
        }
        let elapsed_ms = self.base_real.elapsed().as_millis() as f64;
        self.base_sim + chrono::Duration::milliseconds((elapsed_ms * speed) as i64)
    }

    /// Snapshot current sim time into the bases. Must happen before any
    /// effective-speed change so time never jumps.
    fn reanchor(&mut self) {
        self.base_sim = self.now();
        self.base_real = Instant::now();
    }
}

impl SimClock {
    pub fn new(start: DateTime<Utc>, speed: f64) -> Self {
        SimClock {
            state: Arc::new(Mutex::new(ClockState {
                base_sim: start,
                base_real: Instant::now(),
                configured_speed: speed.max(0.0),
                active_sessions: 0,
                paused: false,
            })),
            resumed: Arc::new(Notify::new()),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.state.lock().unwrap().now()
    }

    pub fn effective_speed(&self) -> f64 {
        self.state.lock().unwrap().effective_speed()
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().unwrap().paused
    }

    pub fn set_speed(&self, speed: f64) {
        let mut state = self.state.lock().unwrap();
        state.reanchor();
        state.configured_speed = speed.max(0.0);
    }

    pub fn pause(&self) {
        self.state.lock().unwrap().paused = true;
    }

    pub fn resume(&self) {
        self.state.lock().unwrap().paused = false;
        self.resumed.notify_waiters();
    }

    pub async fn wait_for_resume(&self) {
        loop {
            let notified = self.resumed.notified();
            if !self.state.lock().unwrap().paused {
                return;
            }
            notified.await;
        }
    }

    /// A live session holds the clock at realtime. Crossing the 0 <-> 1
    /// boundary changes the effective speed, so the bases reanchor first.
    pub fn session_started(&self) {
        let mut state = self.state.lock().unwrap();
        if state.active_sessions == 0 {
            state.reanchor();
        }
        state.active_sessions += 1;
    }

    pub fn session_ended(&self) {
        let mut state = self.state.lock().unwrap();
        if state.active_sessions == 1 {
            state.reanchor();
        }
        state.active_sessions = state.active_sessions.saturating_sub(1);
    }

    /// Sleep until sim time reaches `target`. In turbo mode the clock jumps
    /// there instantly; otherwise the wait is chunked so speed changes and
    /// pauses take effect mid-flight.
    pub async fn wait_until(&self, target: DateTime<Utc>) {
        loop {
            if self.is_paused() {
                self.wait_for_resume().await;
            }

            let sleep_for = {
                let mut state = self.state.lock().unwrap();
                let speed = state.effective_speed();

                if speed == 0.0 {
                    debug!(%target, "turbo: jumping sim time");
                    state.base_sim = target;
                    state.base_real = Instant::now();
                    return;
                }

                let remaining_ms = (target - state.now()).num_milliseconds();
                if remaining_ms <= 0 {
                    return;
                }
                let real_ms = (remaining_ms as f64 / speed).ceil() as u64;
                Duration::from_millis(real_ms).min(SLEEP_CHUNK)
            };

            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(1994, 6, 15, 12, 0, 0).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_turbo_jump() {
        let clock = SimClock::new(epoch(), 0.0);
        let target = epoch() + chrono::Duration::hours(3);

        let started = Instant::now();
        clock.wait_until(target).await;
        assert!(started.elapsed() < Duration::from_millis(10));
        assert_eq!(clock.now(), target);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_session_forces_realtime() {
        let clock = SimClock::new(epoch(), 0.0);
        let target = epoch() + chrono::Duration::hours(3);
        clock.wait_until(target).await;

        clock.session_started();
        assert_eq!(clock.effective_speed(), 1.0);

        let started = Instant::now();
        clock.wait_until(target + chrono::Duration::seconds(10)).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(12));

        clock.session_ended();
        assert_eq!(clock.effective_speed(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speedup() {
        let clock = SimClock::new(epoch(), 60.0);
        let started = Instant::now();
        clock.wait_until(epoch() + chrono::Duration::minutes(10)).await;
        // 10 sim-minutes at 60x is about 10 wall-seconds
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(9));
        assert!(elapsed < Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monotonic_across_transitions() {
        let clock = SimClock::new(epoch(), 4.0);
        let mut last = clock.now();

        tokio::time::sleep(Duration::from_millis(250)).await;
        clock.set_speed(0.0);
        assert!(clock.now() >= last);
        last = clock.now();

        clock.session_started();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(clock.now() >= last);
        last = clock.now();

        clock.session_ended();
        assert!(clock.now() >= last);
        last = clock.now();

        clock.pause();
        clock.resume();
        assert!(clock.now() >= last);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_blocks_wait_until() {
        let clock = SimClock::new(epoch(), 1.0);
        clock.pause();

        let waiter = {
            let clock = clock.clone();
            let target = epoch() + chrono::Duration::seconds(1);
            tokio::spawn(async move {
                clock.wait_until(target).await;
            })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        clock.resume();
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_nested_sessions_keep_realtime() {
        let clock = SimClock::new(epoch(), 0.0);
        clock.session_started();
        clock.session_started();
        clock.session_ended();
        // one session still live
        assert_eq!(clock.effective_speed(), 1.0);
        clock.session_ended();
        assert_eq!(clock.effective_speed(), 0.0);
    }
}
