//! Ordered, fail-open event bus for sandbox lifecycle and sync events.
//!
//! Publishing never blocks: live subscribers read from a bounded
//! `tokio::sync::broadcast` channel and slow ones skip ahead. Every event is
//! also kept in a bounded history for replay, until its sandbox has been
//! retired for longer than the retention window.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::config::ManagerConfig;
use crate::types::{SandboxEvent, SandboxId};

struct BusState {
    sender: Option<broadcast::Sender<SandboxEvent>>,
    next_sequence: u64,
    history: VecDeque<SandboxEvent>,
    last_timestamp: HashMap<SandboxId, DateTime<Utc>>,
    retired: HashMap<SandboxId, Instant>,
}

/// Event bus shared by the manager, handles and the git sync tracker.
pub struct EventBus {
    state: Mutex<BusState>,
    history_limit: usize,
    retention: Duration,
}

impl EventBus {
    pub fn new(buffer: usize, history_limit: usize, retention: Duration) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self {
            state: Mutex::new(BusState {
                sender: Some(sender),
                next_sequence: 1,
                history: VecDeque::new(),
                last_timestamp: HashMap::new(),
                retired: HashMap::new(),
            }),
            history_limit: history_limit.max(1),
            retention,
        }
    }

    pub fn from_config(config: &ManagerConfig) -> Self {
        Self::new(
            config.event_buffer,
            config.event_history_limit,
            config.event_retention,
        )
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stamps and publishes an event.
    ///
    /// The bus assigns the sequence number and bumps the timestamp if needed
    /// so that timestamps strictly increase per sandbox. Failures (closed
    /// bus) are logged and swallowed.
    pub fn publish(&self, mut event: SandboxEvent) {
        let mut state = self.lock();

        let Some(sender) = state.sender.clone() else {
            tracing::warn!(
                sandbox_id = %event.sandbox_id,
                kind = ?event.kind,
                "event bus closed, dropping event"
            );
            return;
        };

        event.sequence = state.next_sequence;
        state.next_sequence += 1;

        let now = Utc::now();
        let timestamp = match state.last_timestamp.get(&event.sandbox_id) {
            Some(last) if *last >= now => *last + chrono::Duration::microseconds(1),
            _ => now,
        };
        event.timestamp = timestamp;
        state
            .last_timestamp
            .insert(event.sandbox_id.clone(), timestamp);

        self.prune(&mut state);
        if state.history.len() >= self.history_limit {
            if let Some(dropped) = state.history.pop_front() {
                tracing::warn!(
                    sequence = dropped.sequence,
                    sandbox_id = %dropped.sandbox_id,
                    "event history full, dropping oldest event"
                );
            }
        }
        state.history.push_back(event.clone());

        // Sent under the lock so live order matches sequence order. A
        // broadcast send never waits on subscribers.
        if sender.send(event).is_err() {
            tracing::trace!("no live subscribers");
        }
    }

    /// Replays retained events, optionally for a single sandbox.
    ///
    /// The returned iterator is a snapshot taken at call time.
    pub fn subscribe_history(
        &self,
        sandbox_id: Option<&SandboxId>,
    ) -> std::vec::IntoIter<SandboxEvent> {
        let state = self.lock();
        state
            .history
            .iter()
            .filter(|e| sandbox_id.map_or(true, |id| &e.sandbox_id == id))
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Follows events published from now on, optionally for a single sandbox.
    ///
    /// The stream ends when the bus is closed or the subscription is dropped.
    pub fn subscribe_live(&self, sandbox_id: Option<SandboxId>) -> LiveEvents {
        let receiver = self.lock().sender.as_ref().map(|s| s.subscribe());
        LiveEvents {
            receiver,
            filter: sandbox_id,
        }
    }

    /// Starts the retention clock for a sandbox that left the registry.
    pub fn retire(&self, sandbox_id: &SandboxId) {
        self.lock()
            .retired
            .entry(sandbox_id.clone())
            .or_insert_with(Instant::now);
    }

    /// Closes the bus. Live subscribers drain what they already received
    /// and then end; later publishes are dropped.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.sender.take().is_some() {
            tracing::info!(retained = state.history.len(), "event bus closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().sender.is_none()
    }

    fn prune(&self, state: &mut BusState) {
        let expired: Vec<SandboxId> = state
            .retired
            .iter()
            .filter(|(_, since)| since.elapsed() >= self.retention)
            .map(|(id, _)| id.clone())
            .collect();
        if expired.is_empty() {
            return;
        }

        state
            .history
            .retain(|event| !expired.contains(&event.sandbox_id));
        for id in &expired {
            state.retired.remove(id);
            state.last_timestamp.remove(id);
        }
        tracing::debug!(sandboxes = expired.len(), "pruned retired event history");
    }
}

/// A live event subscription.
pub struct LiveEvents {
    receiver: Option<broadcast::Receiver<SandboxEvent>>,
    filter: Option<SandboxId>,
}

impl LiveEvents {
    /// Waits for the next matching event. Returns `None` once the bus is
    /// closed and everything already sent has been read.
    pub async fn next(&mut self) -> Option<SandboxEvent> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if self.filter.as_ref().map_or(true, |id| &event.sandbox_id == id) {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "live event subscriber lagged, events skipped");
                }
                Err(RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventKind, SandboxPhase};

    fn bus() -> EventBus {
        EventBus::new(16, 100, Duration::from_secs(3600))
    }

    fn phase_event(id: &str, to: SandboxPhase) -> SandboxEvent {
        SandboxEvent::phase_changed(SandboxId::from(id), SandboxPhase::Pending, to, None)
    }

    #[test]
    fn history_is_ordered_and_filtered() {
        let bus = bus();
        bus.publish(phase_event("a", SandboxPhase::Provisioning));
        bus.publish(phase_event("b", SandboxPhase::Provisioning));
        bus.publish(phase_event("a", SandboxPhase::Running));

        let all: Vec<_> = bus.subscribe_history(None).collect();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].sequence < w[1].sequence));

        let only_a: Vec<_> = bus
            .subscribe_history(Some(&SandboxId::from("a")))
            .map(|e| e.phase())
            .collect();
        assert_eq!(
            only_a,
            vec![Some(SandboxPhase::Provisioning), Some(SandboxPhase::Running)]
        );
    }

    #[test]
    fn timestamps_strictly_increase_per_sandbox() {
        let bus = bus();
        for _ in 0..50 {
            bus.publish(phase_event("a", SandboxPhase::Running));
        }
        let events: Vec<_> = bus.subscribe_history(None).collect();
        assert!(events.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn history_drops_oldest_when_full() {
        let bus = EventBus::new(4, 2, Duration::from_secs(60));
        bus.publish(phase_event("a", SandboxPhase::Provisioning));
        bus.publish(phase_event("a", SandboxPhase::Running));
        bus.publish(phase_event("a", SandboxPhase::Stopping));

        let kept: Vec<_> = bus.subscribe_history(None).map(|e| e.sequence).collect();
        assert_eq!(kept, vec![2, 3]);
    }

    #[test]
    fn retired_sandboxes_are_pruned_after_retention() {
        let bus = EventBus::new(4, 100, Duration::ZERO);
        bus.publish(phase_event("old", SandboxPhase::Stopped));
        bus.retire(&SandboxId::from("old"));
        bus.publish(phase_event("new", SandboxPhase::Running));

        let ids: Vec<_> = bus.subscribe_history(None).map(|e| e.sandbox_id).collect();
        assert_eq!(ids, vec![SandboxId::from("new")]);
    }

    #[test]
    fn publish_after_close_is_dropped() {
        let bus = bus();
        bus.close();
        bus.publish(phase_event("a", SandboxPhase::Running));
        assert!(bus.is_closed());
        assert_eq!(bus.subscribe_history(None).count(), 0);
    }

    #[tokio::test]
    async fn live_subscription_filters_and_ends_on_close() {
        let bus = bus();
        let mut live = bus.subscribe_live(Some(SandboxId::from("a")));

        bus.publish(phase_event("b", SandboxPhase::Running));
        bus.publish(SandboxEvent::new(
            SandboxId::from("a"),
            EventKind::ExecCompleted {
                command: "true".into(),
                exit_code: 0,
            },
        ));
        bus.close();

        let event = live.next().await.expect("expected an event");
        assert_eq!(event.sandbox_id, SandboxId::from("a"));
        assert!(live.next().await.is_none());
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_ahead() {
        let bus = EventBus::new(2, 100, Duration::from_secs(60));
        let mut live = bus.subscribe_live(None);
        for _ in 0..5 {
            bus.publish(phase_event("a", SandboxPhase::Running));
        }

        let event = live.next().await.expect("expected an event");
        assert!(event.sequence >= 4);
    }

    #[tokio::test]
    async fn subscribing_to_closed_bus_ends_immediately() {
        let bus = bus();
        bus.close();
        assert!(bus.subscribe_live(None).next().await.is_none());
    }
}
