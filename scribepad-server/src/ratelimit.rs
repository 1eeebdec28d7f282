//! Fixed-window throttles for inbound events and connection attempts.

use std::net::IpAddr;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::EngineConfig;

/// A fixed window allowing at most `max` acquisitions per `window`.
#[derive(Debug)]
pub struct RateWindow {
    max: u32,
    window: Duration,
    started: Instant,
    count: u32,
}

impl RateWindow {
    /// A window permitting `max` events per `window`.
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            started: Instant::now(),
            count: 0,
        }
    }

    /// Counts one event, returning whether it is inside the budget.
    pub fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.started) >= self.window {
            self.started = now;
            self.count = 0;
        }
        if self.count < self.max {
            self.count += 1;
            true
        } else {
            false
        }
    }
}

/// Throttle tier an inbound event belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventClass {
    /// Document-scoped events: join, edit, save.
    Document,
    /// Everything else on the connection.
    General,
}

/// Per-connection event throttle with one window per tier.
#[derive(Debug)]
pub struct EventLimiter {
    document: RateWindow,
    general: RateWindow,
}

impl EventLimiter {
    /// Builds both tiers from the configured per-second budgets.
    pub fn new(config: &EngineConfig) -> Self {
        let second = Duration::from_secs(1);
        Self {
            document: RateWindow::new(config.document_events_per_second, second),
            general: RateWindow::new(config.general_events_per_second, second),
        }
    }

    /// Counts one event in its tier, returning whether it may proceed.
    pub fn allow(&mut self, class: EventClass) -> bool {
        match class {
            EventClass::Document => self.document.try_acquire(),
            EventClass::General => self.general.try_acquire(),
        }
    }
}

/// Per-source-address connection throttle shared by all handlers.
#[derive(Debug)]
pub struct ConnectionGate {
    max_per_minute: u32,
    by_addr: DashMap<IpAddr, RateWindow>,
}

impl ConnectionGate {
    /// A gate admitting `max_per_minute` connections per source address.
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            by_addr: DashMap::new(),
        }
    }

    /// Counts one connection attempt from `addr`.
    pub fn allow(&self, addr: IpAddr) -> bool {
        self.by_addr
            .entry(addr)
            .or_insert_with(|| RateWindow::new(self.max_per_minute, Duration::from_secs(60)))
            .try_acquire()
    }
}
