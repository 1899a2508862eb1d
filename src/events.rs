// Scripted Gateway - Event Channel
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Per-token broadcast of project notifications. Any number of sessions
// may be open on one token; each has its own cursor, so one slow session
// lags alone and never stalls the others or the publisher.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    FileChanged,
    Presence,
    Message,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::FileChanged => "file-changed",
            EventKind::Presence => "presence",
            EventKind::Message => "message",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Session that caused the event, never echoed back to it
    #[serde(skip)]
    origin: Option<u64>,
}

impl Event {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self { kind, payload, timestamp: Utc::now(), origin: None }
    }
}

// ============================================================================
// HUB
// ============================================================================

pub struct EventHub {
    channels: DashMap<String, broadcast::Sender<Event>>,
    capacity: usize,
    next_session: AtomicU64,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
            next_session: AtomicU64::new(1),
        }
    }

    /// Open a session on `token`. Peers see a presence event.
    pub fn subscribe(self: &Arc<Self>, token: &str) -> Session {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (rx, sessions) = {
            let entry = self
                .channels
                .entry(token.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0);
            let rx = entry.subscribe();
            (rx, entry.receiver_count())
        };

        log::debug!("Event session {} opened on {} ({} open)", id, token, sessions);
        self.send(
            token,
            Event {
                origin: Some(id),
                ..Event::new(
                    EventKind::Presence,
                    json!({ "session": id, "state": "joined", "sessions": sessions }),
                )
            },
        );

        Session { hub: Arc::clone(self), token: token.to_string(), id, rx: Some(rx) }
    }

    /// Deliver to every open session on `token`. Returns how many sessions
    /// were open; zero is not an error.
    pub fn publish(&self, token: &str, kind: EventKind, payload: Value) -> usize {
        self.send(token, Event::new(kind, payload))
    }

    pub fn file_changed(&self, token: &str, path: &str, change: &str) -> usize {
        self.publish(token, EventKind::FileChanged, json!({ "path": path, "change": change }))
    }

    pub fn sessions(&self, token: &str) -> usize {
        self.channels.get(token).map(|tx| tx.receiver_count()).unwrap_or(0)
    }

    /// Tokens with at least one open session
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn send(&self, token: &str, event: Event) -> usize {
        match self.channels.get(token) {
            Some(tx) => tx.send(event).unwrap_or(0),
            None => 0,
        }
    }

    /// Called once the session's receiver is gone, so the count is exact.
    fn leave(&self, token: &str, id: u64) {
        let remaining = self.sessions(token);
        self.send(
            token,
            Event {
                origin: Some(id),
                ..Event::new(
                    EventKind::Presence,
                    json!({ "session": id, "state": "left", "sessions": remaining }),
                )
            },
        );
        self.channels.remove_if(token, |_, tx| tx.receiver_count() == 0);
        log::debug!("Event session {} closed on {} ({} open)", id, token, remaining);
    }
}

// ============================================================================
// SESSION
// ============================================================================

pub struct Session {
    hub: Arc<EventHub>,
    token: String,
    id: u64,
    /// Taken on drop before the hub is told
    rx: Option<broadcast::Receiver<Event>>,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Relay a client message to the other sessions on this token.
    pub fn send_message(&self, body: Value) -> usize {
        self.hub.send(
            &self.token,
            Event {
                origin: Some(self.id),
                ..Event::new(EventKind::Message, json!({ "from": self.id, "body": body }))
            },
        )
    }

    /// Next event for this session. Events lost to lag are skipped.
    pub async fn recv(&mut self) -> Option<Event> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) if event.origin == Some(self.id) => continue,
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(missed)) => {
                    log::warn!("Event session {} lagged, {} events dropped", self.id, missed);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of recv()
    pub fn try_recv(&mut self) -> Option<Event> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.try_recv() {
                Ok(event) if event.origin == Some(self.id) => continue,
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(missed)) => {
                    log::warn!("Event session {} lagged, {} events dropped", self.id, missed);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Stream of events; dropping it closes the session.
    pub fn into_stream(mut self) -> impl Stream<Item = Event> + Send + 'static {
        async_stream::stream! {
            while let Some(event) = self.recv().await {
                yield event;
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.rx.take();
        self.hub.leave(&self.token, self.id);
    }
}

// ============================================================================
// TESTS
// ============================================================================
