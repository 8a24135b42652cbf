use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::cp437;
use crate::terminal::VirtualTerminal;

/// How many distinct screens the rolling history keeps.
const HISTORY_LIMIT: usize = 40;
/// Grace period when the screen already ends in something promptish.
const PROMPT_GRACE: Duration = Duration::from_millis(300);

/// Sits between the connection and the session loop: accumulates bytes into
/// the virtual terminal and wakes the agent when the stream has gone idle
/// and input is expected.
#[derive(Clone)]
pub struct TerminalBuffer {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    idle_timeout: Duration,
}

struct Inner {
    terminal: VirtualTerminal,
    last_data: Option<Instant>,
    history: VecDeque<String>,
    closed: bool,
}

impl TerminalBuffer {
    pub fn new(idle_timeout_ms: u64) -> Self {
        TerminalBuffer {
            inner: Arc::new(Mutex::new(Inner {
                terminal: VirtualTerminal::new(),
                last_data: None,
                history: VecDeque::new(),
                closed: false,
            })),
            notify: Arc::new(Notify::new()),
            idle_timeout: Duration::from_millis(idle_timeout_ms),
        }
    }

    /// Push a chunk of raw board bytes through the CP437 decoder into the
    /// terminal and re-arm the idle timer.
    pub fn feed(&self, bytes: &[u8]) {
        let text = cp437::decode(bytes);
        {
            let mut inner = self.inner.lock().unwrap();
            inner.terminal.write(&text);
            inner.last_data = Some(Instant::now());
        }
        self.notify.notify_waiters();
    }

    /// Tear down: wakes any pending waiter with an empty screen. Further
    /// `wait_for_idle` calls return immediately.
    pub fn reset(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.terminal.reset();
            inner.closed = true;
        }
        self.notify.notify_waiters();
    }

    /// Block until the stream is idle, then return the rendered screen.
    /// Idle means no data for `idle_timeout`, or a short grace after data
    /// when the screen tail already looks like a prompt.
    pub async fn wait_for_idle(&self) -> String {
        let called = Instant::now();
        loop {
            let deadline = {
                let inner = self.inner.lock().unwrap();
                if inner.closed {
                    return String::new();
                }

                // re-arm from whichever is later: the last byte or this call,
                // so a silent board still paces ticks at the idle timeout
                let anchor = inner.last_data.map_or(called, |t| t.max(called));
                let timeout = if tail_is_prompt(&inner.terminal) {
                    PROMPT_GRACE
                } else {
                    self.idle_timeout
                };
                anchor + timeout
            };

            if Instant::now() >= deadline {
                return self.resolve();
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = self.notify.notified() => {}
            }
        }
    }

    fn resolve(&self) -> String {
        let mut inner = self.inner.lock().unwrap();
        let snapshot = inner.terminal.snapshot();

        if !snapshot.is_empty() && inner.history.back() != Some(&snapshot) {
            inner.history.push_back(snapshot.clone());
            while inner.history.len() > HISTORY_LIMIT {
                inner.history.pop_front();
            }
        }

        snapshot
    }

    /// The recorded history of distinct screens, oldest first.
    pub fn history(&self) -> Vec<String> {
        self.inner.lock().unwrap().history.iter().cloned().collect()
    }

    /// The two screens before the current one, for early-turn context.
    pub fn prior_screens(&self, n: usize) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let len = inner.history.len();
        if len <= 1 {
            return Vec::new();
        }
        // skip the most recent entry; it is the current screen
        let end = len - 1;
        let start = end.saturating_sub(n);
        inner.history.iter().skip(start).take(end - start).cloned().collect()
    }

    pub fn snapshot(&self) -> String {
        self.inner.lock().unwrap().terminal.snapshot()
    }
}

/// Does any of the last three non-blank lines look like the board waiting
/// for input?
fn tail_is_prompt(terminal: &VirtualTerminal) -> bool {
    let tail = terminal.tail(3);
    tail.lines().any(line_is_prompt)
}

fn line_is_prompt(line: &str) -> bool {
    let line = line.trim().to_lowercase();
    if line.is_empty() {
        return false;
    }
    if line.ends_with('?') || line.ends_with(':') || line.ends_with('>') {
        return true;
    }
    line.contains("[y/n]")
        || line.contains("[more]")
        || line.contains("[enter]")
        || line.contains("press enter")
        || line.contains("press return")
        || line.contains("press any key")
        || line.contains("min left)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_idle_after_quiet_period() {
        let buffer = TerminalBuffer::new(1500);
        buffer.feed(b"Scanning message bases");

        let started = Instant::now();
        let screen = buffer.wait_for_idle().await;
        assert_eq!(screen, "Scanning message bases");
        assert!(started.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_tail_short_grace() {
        let buffer = TerminalBuffer::new(1500);
        buffer.feed(b"Enter your handle: ");

        let started = Instant::now();
        let screen = buffer.wait_for_idle().await;
        assert_eq!(screen, "Enter your handle:");
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_data_rearms_timer() {
        let buffer = TerminalBuffer::new(1000);
        buffer.feed(b"first");

        let waiter = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.wait_for_idle().await })
        };

        tokio::time::sleep(Duration::from_millis(600)).await;
        buffer.feed(b" second");
        let screen = waiter.await.unwrap();
        assert_eq!(screen, "first second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_returns_empty_immediately() {
        let buffer = TerminalBuffer::new(1500);
        buffer.reset();
        let screen = buffer.wait_for_idle().await;
        assert_eq!(screen, "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_wakes_pending_waiter() {
        let buffer = TerminalBuffer::new(60_000);
        buffer.feed(b"hanging screen");

        let waiter = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.wait_for_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        buffer.reset();
        assert_eq!(waiter.await.unwrap(), "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_distinct_and_bounded() {
        let buffer = TerminalBuffer::new(100);

        for i in 0..45 {
            buffer.feed(format!("\x1b[2J\x1b[Hscreen {}", i).as_bytes());
            buffer.wait_for_idle().await;
            // an unchanged screen does not duplicate the history entry
            buffer.wait_for_idle().await;
        }

        let history = buffer.history();
        assert_eq!(history.len(), 40);
        assert_eq!(history[0], "screen 5");
        assert_eq!(history[39], "screen 44");
    }

    #[test]
    fn test_prompt_patterns() {
        assert!(line_is_prompt("Password:"));
        assert!(line_is_prompt("What is your choice? "));
        assert!(line_is_prompt("Main Menu >"));
        assert!(line_is_prompt("Continue [Y/n]"));
        assert!(line_is_prompt("-- [More] --"));
        assert!(line_is_prompt("Press ENTER to continue"));
        assert!(line_is_prompt("TradeWars 2002  (38 min left)"));
        assert!(!line_is_prompt("Welcome to The Sanctum BBS"));
        assert!(!line_is_prompt(""));
    }
}
