//! Health of a transport's dedicated subscriber connection.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};

use serde::Serialize;

use super::current_time_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerStatus {
    /// `start()` not called yet
    Idle,
    /// Subscribed and receiving
    Connected,
    /// Connection lost, retrying with backoff
    Reconnecting,
    /// `stop()` called
    Stopped,
}

impl ListenerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerStatus::Idle => "idle",
            ListenerStatus::Connected => "connected",
            ListenerStatus::Reconnecting => "reconnecting",
            ListenerStatus::Stopped => "stopped",
        }
    }

    /// Numeric form exported as a gauge
    pub fn as_gauge(&self) -> i64 {
        match self {
            ListenerStatus::Idle => 0,
            ListenerStatus::Connected => 1,
            ListenerStatus::Reconnecting => 2,
            ListenerStatus::Stopped => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ListenerStatus::Connected,
            2 => ListenerStatus::Reconnecting,
            3 => ListenerStatus::Stopped,
            _ => ListenerStatus::Idle,
        }
    }
}

pub struct ListenerHealth {
    status: AtomicU8,
    last_connected_ms: AtomicI64,
    reconnect_attempts: AtomicU32,
    total_reconnections: AtomicU32,
    events_received: AtomicU64,
}

impl ListenerHealth {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(ListenerStatus::Idle as u8),
            last_connected_ms: AtomicI64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            total_reconnections: AtomicU32::new(0),
            events_received: AtomicU64::new(0),
        }
    }

    pub fn set_connected(&self) {
        let previous = self
            .status
            .swap(ListenerStatus::Connected as u8, Ordering::AcqRel);
        self.last_connected_ms
            .store(current_time_ms(), Ordering::Release);

        if ListenerStatus::from_u8(previous) == ListenerStatus::Reconnecting {
            self.total_reconnections.fetch_add(1, Ordering::AcqRel);
        }
        self.reconnect_attempts.store(0, Ordering::Release);
    }

    pub fn set_reconnecting(&self) {
        self.status
            .store(ListenerStatus::Reconnecting as u8, Ordering::Release);
        self.reconnect_attempts.fetch_add(1, Ordering::AcqRel);
    }

    pub fn set_stopped(&self) {
        self.status
            .store(ListenerStatus::Stopped as u8, Ordering::Release);
    }

    pub fn record_event(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn status(&self) -> ListenerStatus {
        ListenerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Only a connected listener delivers events to this process.
    pub fn is_healthy(&self) -> bool {
        self.status() == ListenerStatus::Connected
    }

    pub fn stats(&self) -> ListenerHealthStats {
        ListenerHealthStats {
            status: self.status(),
            last_connected_ms: self.last_connected_ms.load(Ordering::Acquire),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Acquire),
            total_reconnections: self.total_reconnections.load(Ordering::Acquire),
            events_received: self.events_received.load(Ordering::Relaxed),
        }
    }
}

impl Default for ListenerHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenerHealthStats {
    pub status: ListenerStatus,
    pub last_connected_ms: i64,
    pub reconnect_attempts: u32,
    pub total_reconnections: u32,
    pub events_received: u64,
}
