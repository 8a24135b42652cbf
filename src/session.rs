use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::actions::{parse_actions, Action};
use crate::config::RuntimeConfig;
use crate::events::{EventBus, EventKind};
use crate::extract;
use crate::idle::TerminalBuffer;
use crate::memory::AgentMemory;
use crate::persona::Persona;
use crate::prompt;
use crate::provider::{Brain, ChatMessage};
use crate::ratelimit::RateLimiter;
use crate::telnet::BoardConnection;
use crate::transcript::SessionTranscript;

/// Keep the system message plus this many recent turns in the conversation.
const HISTORY_LIMIT: usize = 16;
/// Pause between typed lines and the enter that follows.
const PRE_ENTER_DELAY: Duration = Duration::from_millis(100);
/// Human-ish gap between consecutive board-visible actions.
const INTER_ACTION_DELAY: Duration = Duration::from_millis(200);
/// Recovery pause after a model failure before the next tick retries.
const ERROR_BACKOFF: Duration = Duration::from_secs(2);

/// Why a session loop came to rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Disconnected,
    ConnectionLost,
    MaxTurns,
    TimeLimit,
    Stopped,
}

impl EndReason {
    fn as_str(&self) -> &'static str {
        match self {
            EndReason::Disconnected => "disconnected",
            EndReason::ConnectionLost => "connection_lost",
            EndReason::MaxTurns => "max_turns",
            EndReason::TimeLimit => "time_limit",
            EndReason::Stopped => "stopped",
        }
    }
}

/// Lets the pool ask a running session to wind down.
#[derive(Clone)]
pub struct SessionStop {
    running: Arc<AtomicBool>,
}

impl SessionStop {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Drives one persona through one connect-to-disconnect run: wait for the
/// screen to settle, show it to the model, act out the reply, and at the end
/// distill the transcript into memory.
pub struct SessionLoop {
    connection: Arc<BoardConnection>,
    buffer: TerminalBuffer,
    memory: AgentMemory,
    persona: Arc<Persona>,
    config: RuntimeConfig,
    brain: Arc<dyn Brain>,
    limiter: Option<RateLimiter>,
    events: EventBus,
    running: Arc<AtomicBool>,

    turn: u32,
    transcript: SessionTranscript,
    conversation: Vec<ChatMessage>,
    last_screen_hash: Option<u64>,
    stuck_count: u32,
}

impl SessionLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection: Arc<BoardConnection>,
        buffer: TerminalBuffer,
        memory: AgentMemory,
        persona: Arc<Persona>,
        config: RuntimeConfig,
        brain: Arc<dyn Brain>,
        limiter: Option<RateLimiter>,
        events: EventBus,
    ) -> Self {
        let system = prompt::build_system_prompt(&persona, &memory);
        SessionLoop {
            connection,
            buffer,
            memory,
            persona,
            config,
            brain,
            limiter,
            events,
            running: Arc::new(AtomicBool::new(true)),
            turn: 0,
            transcript: SessionTranscript::new(),
            conversation: vec![ChatMessage::system(system)],
            last_screen_hash: None,
            stuck_count: 0,
        }
    }

    pub fn stop_handle(&self) -> SessionStop {
        SessionStop { running: self.running.clone() }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run to completion and return the final memory state. Never panics on
    /// model or board misbehavior; the pool relies on this returning.
    pub async fn run(mut self) -> AgentMemory {
        let started = Instant::now();
        let deadline = started + Duration::from_secs(self.config.session_minutes * 60);

        info!(handle = %self.persona.handle, host = %self.memory.host, "session started");
        self.events.emit(0, EventKind::SessionStart);

        let reason = loop {
            if !self.is_running() {
                break EndReason::Stopped;
            }
            if !self.connection.is_connected() {
                break EndReason::ConnectionLost;
            }
            if self.turn >= self.config.max_turns {
                break EndReason::MaxTurns;
            }
            if Instant::now() >= deadline {
                break EndReason::TimeLimit;
            }

            if let Some(reason) = self.tick().await {
                break reason;
            }
        };

        info!(
            handle = %self.persona.handle,
            turns = self.turn,
            reason = reason.as_str(),
            "session over"
        );

        if self.connection.is_connected() {
            self.connection.disconnect().await;
        }

        self.finalize().await;
        self.events
            .emit(self.turn, EventKind::SessionEnd { reason: reason.as_str().to_string() });
        self.memory
    }

    /// One read-think-act cycle. Returns Some(reason) when the loop should
    /// stop.
    async fn tick(&mut self) -> Option<EndReason> {
        let screen = self.buffer.wait_for_idle().await;
        if screen.is_empty() {
            // stream reset or nothing rendered; outer loop re-checks state
            return None;
        }

        self.turn += 1;
        self.transcript.add_screen(self.turn, &screen);
        self.events.emit(self.turn, EventKind::Screen { text: screen.clone() });

        if is_pause_prompt(&screen) {
            debug!(turn = self.turn, "pause prompt, sending enter");
            self.events.emit(self.turn, EventKind::MorePrompt);
            let _ = self.connection.send_key("enter").await;
            return None;
        }

        if self.detect_stuck(&screen) {
            warn!(turn = self.turn, "screen frozen, nudging with esc+enter");
            self.events.emit(self.turn, EventKind::Stuck);
            let _ = self.connection.send_key("esc").await;
            tokio::time::sleep(Duration::from_millis(500)).await;
            let _ = self.connection.send_key("enter").await;
            return None;
        }

        let user = if self.turn <= 3 {
            prompt::build_user_message(self.turn, &self.buffer.prior_screens(2), &screen)
        } else {
            prompt::build_user_message(self.turn, &[], &screen)
        };
        self.conversation.push(ChatMessage::user(user));
        self.trim_conversation();

        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let response = match self.brain.complete(&self.conversation).await {
            Ok(text) => text,
            Err(err) => {
                error!(turn = self.turn, error = %err, "model call failed for this tick");
                self.events.emit(
                    self.turn,
                    EventKind::Error { message: err.to_string(), reason: Some("llm".to_string()) },
                );
                self.conversation.pop();
                tokio::time::sleep(ERROR_BACKOFF).await;
                return None;
            }
        };

        self.conversation.push(ChatMessage::assistant(&response));
        self.transcript.add_response(self.turn, &response);
        self.events.emit(self.turn, EventKind::Response { text: response.clone() });

        let actions = parse_actions(&response);
        self.execute(actions).await
    }

    /// Identical trimmed screens three ticks running means the board is
    /// waiting on something we did not see; esc plus enter shakes it loose.
    fn detect_stuck(&mut self, screen: &str) -> bool {
        let mut hasher = DefaultHasher::new();
        screen.trim().hash(&mut hasher);
        let hash = hasher.finish();

        if self.last_screen_hash == Some(hash) {
            self.stuck_count += 1;
            if self.stuck_count >= 2 {
                self.stuck_count = 0;
                return true;
            }
        } else {
            self.stuck_count = 0;
        }
        self.last_screen_hash = Some(hash);
        false
    }

    fn trim_conversation(&mut self) {
        if self.conversation.len() > HISTORY_LIMIT + 1 {
            let drop = self.conversation.len() - (HISTORY_LIMIT + 1);
            self.conversation.drain(1..1 + drop);
        }
    }

    async fn execute(&mut self, actions: Vec<Action>) -> Option<EndReason> {
        let mut prev_visible = false;

        for action in actions {
            if !self.is_running() {
                return Some(EndReason::Stopped);
            }
            if !self.connection.is_connected() {
                return Some(EndReason::ConnectionLost);
            }

            let visible = !matches!(action, Action::Thinking(_) | Action::Wait(_));
            if visible && prev_visible {
                tokio::time::sleep(INTER_ACTION_DELAY).await;
            }

            match &action {
                Action::Thinking(text) => {
                    self.events.emit(self.turn, EventKind::Thinking { text: text.clone() });
                    continue; // transparent: does not count for pacing
                }
                Action::Line(text) => {
                    if self.type_text(text).await.is_err() {
                        return Some(EndReason::ConnectionLost);
                    }
                    tokio::time::sleep(PRE_ENTER_DELAY).await;
                    if self.connection.send_key("enter").await.is_err() {
                        return Some(EndReason::ConnectionLost);
                    }
                }
                Action::Type(text) => {
                    if self.type_text(text).await.is_err() {
                        return Some(EndReason::ConnectionLost);
                    }
                }
                Action::Key(key) => {
                    if self.connection.send_key(key).await.is_err() {
                        return Some(EndReason::ConnectionLost);
                    }
                }
                Action::Wait(ms) => {
                    tokio::time::sleep(Duration::from_millis(*ms)).await;
                }
                Action::Memory(note) => {
                    self.transcript.add_memory_note(note);
                    self.events.emit(self.turn, EventKind::MemoryNote { text: note.clone() });
                }
                Action::Disconnect(reason) => {
                    info!(handle = %self.persona.handle, reason = %reason, "agent logging off");
                    self.events.emit(self.turn, EventKind::ActionExecuted { action: action.clone() });
                    self.running.store(false, Ordering::SeqCst);
                    self.connection.disconnect().await;
                    return Some(EndReason::Disconnected);
                }
            }

            self.events.emit(self.turn, EventKind::ActionExecuted { action: action.clone() });
            prev_visible = visible;
        }

        None
    }

    /// Type character by character with human keystroke pacing.
    async fn type_text(&self, text: &str) -> anyhow::Result<()> {
        let mut buf = [0u8; 4];
        for ch in text.chars() {
            let delay_ms = {
                use rand::Rng;
                let mut rng = rand::thread_rng();
                rng.gen_range(self.config.keystroke_min_ms..=self.config.keystroke_max_ms.max(self.config.keystroke_min_ms))
            };
            self.connection.send(ch.encode_utf8(&mut buf).as_bytes()).await?;
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        Ok(())
    }

    /// Persist the transcript and distill it into memory. Every failure in
    /// here is logged and swallowed; extraction must never poison the pool.
    async fn finalize(&mut self) {
        if let Err(err) = self.transcript.write_jsonl(&self.memory.sessions_dir()) {
            error!(handle = %self.persona.handle, error = %err, "failed to write transcript");
        }

        if self.transcript.records.is_empty() {
            return; // nothing happened; nothing to extract
        }

        self.events.emit(self.turn, EventKind::MemoryExtracting);

        if self.memory.credentials.registered {
            self.memory.credentials.last_login = Some(Utc::now());
        }

        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        match extract::extract_and_merge(
            self.brain.as_ref(),
            &self.persona,
            &mut self.memory,
            &self.transcript,
        )
        .await
        {
            Ok(()) => self.events.emit(self.turn, EventKind::MemoryExtracted),
            Err(err) => {
                error!(handle = %self.persona.handle, error = %err, "memory extraction failed");
                self.events.emit(
                    self.turn,
                    EventKind::Error { message: err.to_string(), reason: Some("extract".to_string()) },
                );
            }
        }
    }
}

/// Does the tail of the screen look like a pager waiting for a keypress?
/// Checked against the last ~100 characters only.
fn is_pause_prompt(screen: &str) -> bool {
    let skip = screen.chars().count().saturating_sub(100);
    let tail: String = screen.chars().skip(skip).collect::<String>().to_lowercase();

    tail.contains("[more")
        || tail.contains("continue [y/n]")
        || tail.contains("press enter to continue")
        || tail.contains("press return to continue")
        || tail.contains("press any key to continue")
        || tail.contains("pause")
}
