use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::SimClock;
use crate::config::RuntimeConfig;
use crate::events::{EventBus, EventKind};
use crate::idle::TerminalBuffer;
use crate::memory::AgentMemory;
use crate::provider::Brain;
use crate::ratelimit::RateLimiter;
use crate::scheduler::ScheduledSession;
use crate::session::{SessionLoop, SessionStop};
use crate::telnet::{BoardConnection, ConnectionEvent};

const DRAIN_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Active,
    Extracting,
    Done,
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Connecting => write!(f, "connecting"),
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Extracting => write!(f, "extracting"),
            SessionStatus::Done => write!(f, "done"),
            SessionStatus::Error => write!(f, "error"),
        }
    }
}

/// Pool-level view of one session, pushed to status subscribers whenever it
/// changes.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub handle: String,
    pub status: SessionStatus,
    pub turn_count: u32,
    pub current_screen: String,
    pub last_action: Option<String>,
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
}

struct ActiveSession {
    info: SessionInfo,
    stop: SessionStop,
    connection: Arc<BoardConnection>,
}

struct PoolState {
    queue: VecDeque<ScheduledSession>,
    active: HashMap<String, ActiveSession>,
    pending_connections: usize,
    pending_handles: HashSet<String>,
}

struct PoolInner {
    host: String,
    port: u16,
    runtime: RuntimeConfig,
    memory_root: PathBuf,
    brain: Arc<dyn Brain>,
    limiter: RateLimiter,
    clock: SimClock,
    state: Mutex<PoolState>,
    status_tx: mpsc::UnboundedSender<SessionInfo>,
}

impl PoolInner {
    fn emit_status(&self, info: &SessionInfo) {
        let _ = self.status_tx.send(info.clone());
    }
}

/// Bounded-concurrency session runner. Consumes `session:due` events from
/// the scheduler; excess sessions wait in a FIFO queue. A session slot is
/// held from connect attempt to finish.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: &str,
        port: u16,
        runtime: RuntimeConfig,
        memory_root: PathBuf,
        brain: Arc<dyn Brain>,
        limiter: RateLimiter,
        clock: SimClock,
    ) -> (Self, mpsc::UnboundedReceiver<SessionInfo>) {
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let pool = SessionPool {
            inner: Arc::new(PoolInner {
                host: host.to_string(),
                port,
                runtime,
                memory_root,
                brain,
                limiter,
                clock,
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    active: HashMap::new(),
                    pending_connections: 0,
                    pending_handles: HashSet::new(),
                }),
                status_tx,
            }),
        };
        (pool, status_rx)
    }

    /// Consume due sessions until the scheduler side closes.
    pub async fn run(&self, mut due_rx: mpsc::UnboundedReceiver<ScheduledSession>) {
        while let Some(due) = due_rx.recv().await {
            self.enqueue(due);
        }
    }

    pub fn enqueue(&self, due: ScheduledSession) {
        self.inner.state.lock().unwrap().queue.push_back(due);
        Self::try_start_next(&self.inner);
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().unwrap().active.len()
    }

    pub fn pending_connections(&self) -> usize {
        self.inner.state.lock().unwrap().pending_connections
    }

    pub fn queued_count(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    /// Start queued sessions while slots are free. One live session per
    /// persona handle; a queued session whose handle is already on the
    /// board stays queued and later entries may start ahead of it.
    fn try_start_next(inner: &Arc<PoolInner>) {
        loop {
            let due = {
                let mut state = inner.state.lock().unwrap();
                if state.active.len() + state.pending_connections >= inner.runtime.max_concurrent {
                    return;
                }

                let busy: HashSet<String> = state
                    .active
                    .values()
                    .map(|a| a.info.handle.clone())
                    .chain(state.pending_handles.iter().cloned())
                    .collect();
                let Some(idx) = state.queue.iter().position(|s| !busy.contains(&s.handle)) else {
                    return;
                };
                let due = state.queue.remove(idx).expect("index from position");
                state.pending_connections += 1;
                state.pending_handles.insert(due.handle.clone());
                due
            };

            let inner = inner.clone();
            tokio::spawn(async move {
                Self::start_session(&inner, due).await;
                // the slot accounting moves from pending to active (or away
                // entirely on failure) before this point
                {
                    let mut state = inner.state.lock().unwrap();
                    state.pending_connections -= 1;
                }
                Self::try_start_next(&inner);
            });
        }
    }

    async fn start_session(inner: &Arc<PoolInner>, due: ScheduledSession) {
        let id = Uuid::new_v4().to_string();
        let mut info = SessionInfo {
            id: id.clone(),
            handle: due.handle.clone(),
            status: SessionStatus::Connecting,
            turn_count: 0,
            current_screen: String::new(),
            last_action: None,
            started: Utc::now(),
            ended: None,
        };
        inner.emit_status(&info);

        let connect = BoardConnection::connect(&inner.host, inner.port).await;
        let (connection, mut conn_events) = match connect {
            Ok(pair) => pair,
            Err(err) => {
                warn!(handle = %due.handle, error = %err, "connect failed");
                info.status = SessionStatus::Error;
                info.ended = Some(Utc::now());
                inner.emit_status(&info);
                inner.state.lock().unwrap().pending_handles.remove(&due.handle);
                return;
            }
        };
        let connection = Arc::new(connection);

        let buffer = TerminalBuffer::new(inner.runtime.idle_timeout_ms);
        {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                while let Some(event) = conn_events.recv().await {
                    match event {
                        ConnectionEvent::Data(bytes) => buffer.feed(&bytes),
                        ConnectionEvent::Closed | ConnectionEvent::Error(_) => {
                            buffer.reset();
                            break;
                        }
                    }
                }
            });
        }

        let memory = match AgentMemory::load(&inner.memory_root, &inner.host, &due.handle) {
            Ok(memory) => memory,
            Err(err) => {
                warn!(handle = %due.handle, error = %err, "memory load failed");
                connection.disconnect().await;
                info.status = SessionStatus::Error;
                info.ended = Some(Utc::now());
                inner.emit_status(&info);
                inner.state.lock().unwrap().pending_handles.remove(&due.handle);
                return;
            }
        };

        let bus = EventBus::new(&due.handle);
        let bus_rx = bus.subscribe();
        let session = SessionLoop::new(
            connection.clone(),
            buffer,
            memory,
            due.persona.clone(),
            inner.runtime.clone(),
            inner.brain.clone(),
            Some(inner.limiter.clone()),
            bus,
        );
        let stop = session.stop_handle();

        info.status = SessionStatus::Active;
        {
            let mut state = inner.state.lock().unwrap();
            state.pending_handles.remove(&due.handle);
            state.active.insert(
                id.clone(),
                ActiveSession { info: info.clone(), stop, connection: connection.clone() },
            );
        }
        inner.clock.session_started();
        inner.emit_status(&info);
        info!(handle = %due.handle, id = %id, "session slot active");

        // mirror loop events into the pool's status view
        {
            let inner = inner.clone();
            let id = id.clone();
            tokio::spawn(watch_session(inner, id, bus_rx));
        }

        let inner_done = inner.clone();
        tokio::spawn(async move {
            session.run().await;
            Self::finish_session(&inner_done, &id, SessionStatus::Done);
        });
    }

    fn finish_session(inner: &Arc<PoolInner>, id: &str, status: SessionStatus) {
        let removed = {
            let mut state = inner.state.lock().unwrap();
            state.active.remove(id)
        };

        let Some(mut active) = removed else {
            return;
        };
        active.info.status = status;
        active.info.ended = Some(Utc::now());
        inner.emit_status(&active.info);
        inner.clock.session_ended();
        info!(handle = %active.info.handle, id = %id, status = %status, "session slot released");

        let connection = active.connection;
        tokio::spawn(async move { connection.disconnect().await });

        Self::try_start_next(inner);
    }

    /// Cooperative stop with a hard deadline: ask every loop to wind down,
    /// poll for drain, then cut the remaining streams.
    pub async fn shutdown(&self, timeout: Duration) {
        info!("pool shutting down");
        self.inner.limiter.dispose();
        {
            let mut state = self.inner.state.lock().unwrap();
            state.queue.clear();
            for active in state.active.values() {
                active.stop.stop();
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            {
                let state = self.inner.state.lock().unwrap();
                if state.active.is_empty() && state.pending_connections == 0 {
                    return;
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let stragglers: Vec<Arc<BoardConnection>> = {
            let state = self.inner.state.lock().unwrap();
            state.active.values().map(|a| a.connection.clone()).collect()
        };
        warn!(count = stragglers.len(), "force-disconnecting sessions past deadline");
        for connection in stragglers {
            connection.disconnect().await;
        }
    }
}

async fn watch_session(
    inner: Arc<PoolInner>,
    id: String,
    mut bus_rx: mpsc::Receiver<crate::events::SessionEvent>,
) {
    while let Some(event) = bus_rx.recv().await {
        let updated = {
            let mut state = inner.state.lock().unwrap();
            let Some(active) = state.active.get_mut(&id) else {
                break;
            };
            active.info.turn_count = event.turn;
            match &event.kind {
                EventKind::Screen { text } => active.info.current_screen = text.clone(),
                EventKind::ActionExecuted { action } => {
                    active.info.last_action = Some(format!("{:?}", action))
                }
                EventKind::MemoryExtracting => active.info.status = SessionStatus::Extracting,
                _ => {}
            }
            active.info.clone()
        };
        inner.emit_status(&updated);
    }
}
