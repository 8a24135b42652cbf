use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::actions::Action;

/// Everything a session loop reports while running. Consumers subscribe to
/// the bus; none of them can slow the loop down.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub persona_handle: String,
    pub turn: u32,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    SessionStart,
    SessionEnd { reason: String },
    Screen { text: String },
    Thinking { text: String },
    Response { text: String },
    ActionExecuted { action: Action },
    MorePrompt,
    Stuck,
    MemoryNote { text: String },
    MemoryExtracting,
    MemoryExtracted,
    Error { message: String, reason: Option<String> },
}

/// Fan-out to any number of subscribers over bounded channels. A full or
/// dropped subscriber loses events rather than backpressuring the emitter.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<SessionEvent>>>>,
    persona_handle: String,
}

impl EventBus {
    pub fn new(persona_handle: &str) -> Self {
        EventBus {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            persona_handle: persona_handle.to_string(),
        }
    }

    pub fn subscribe(&self) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel(256);
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn emit(&self, turn: u32, kind: EventKind) {
        let event = SessionEvent {
            persona_handle: self.persona_handle.clone(),
            turn,
            timestamp: Utc::now(),
            kind,
        };

        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true, // drop event, keep subscriber
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fanout_to_multiple_subscribers() {
        let bus = EventBus::new("rwilco");
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(1, EventKind::SessionStart);

        let ea = a.recv().await.unwrap();
        let eb = b.recv().await.unwrap();
        assert_eq!(ea.persona_handle, "rwilco");
        assert_eq!(eb.turn, 1);
        assert!(matches!(ea.kind, EventKind::SessionStart));
    }

    #[tokio::test]
    async fn test_emit_never_blocks_on_full_subscriber() {
        let bus = EventBus::new("rwilco");
        let _rx = bus.subscribe(); // never drained

        // well past the channel capacity; emit must not block or fail
        for turn in 0..1000 {
            bus.emit(turn, EventKind::Stuck);
        }
    }

    #[tokio::test]
    async fn test_closed_subscriber_pruned() {
        let bus = EventBus::new("rwilco");
        let rx = bus.subscribe();
        drop(rx);

        bus.emit(0, EventKind::SessionStart);
        assert!(bus.subscribers.lock().unwrap().is_empty());
    }
}
