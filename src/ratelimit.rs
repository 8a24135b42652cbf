use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

/// Process-wide token bucket in front of the model. One token per request;
/// refills at `rpm` per minute. Waiters are served strictly FIFO.
///
/// The bucket starts with a single token, so over any rolling 60 s window at
/// most `rpm + 1` tokens can be released.
#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<State>>,
}

struct State {
    tokens: u32,
    cap: u32,
    waiters: VecDeque<oneshot::Sender<()>>,
    disposed: bool,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        let rpm = requests_per_minute.max(1);
        let state = Arc::new(Mutex::new(State {
            tokens: 1,
            cap: rpm,
            waiters: VecDeque::new(),
            disposed: false,
        }));

        let interval = Duration::from_millis((60_000 / rpm as u64).max(1));
        tokio::spawn(refill_task(Arc::downgrade(&state), interval));

        RateLimiter { state }
    }

    /// Take one token, waiting in line if the bucket is empty. After
    /// `dispose` this returns immediately without a token so shutdown can
    /// never wedge on the bucket.
    pub async fn acquire(&self) {
        let receiver = {
            let mut state = self.state.lock().unwrap();
            if state.disposed {
                return;
            }
            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        // a dropped sender also means dispose; either way, proceed
        let _ = receiver.await;
    }

    /// Stop the refill timer and release every waiter.
    pub fn dispose(&self) {
        let waiters = {
            let mut state = self.state.lock().unwrap();
            state.disposed = true;
            std::mem::take(&mut state.waiters)
        };
        debug!(released = waiters.len(), "rate limiter disposed");
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    #[cfg(test)]
    fn tokens(&self) -> u32 {
        self.state.lock().unwrap().tokens
    }
}

async fn refill_task(state: Weak<Mutex<State>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick is immediate

    loop {
        ticker.tick().await;

        let Some(state) = state.upgrade() else {
            return;
        };
        let mut state = state.lock().unwrap();
        if state.disposed {
            return;
        }

        if state.tokens < state.cap {
            state.tokens += 1;
        }
        while state.tokens > 0 {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            state.tokens -= 1;
            let _ = waiter.send(());
        }
    }
}
