//! The event pump: many producers, one consumer, broadcast fan-out.
//!
//! Producers (the driver and pool units) send into one unbounded channel.
//! The pump stamps each event into the log and republishes on a broadcast
//! channel. A reader that falls behind loses the oldest events from its own
//! buffer only and receives a synthesized SlowObserver; the log is never
//! trimmed by reader lag.

use crate::log::EventLog;
use opscenter_core::OfficeEvent;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

const FANOUT_CAPACITY: usize = 1024;

pub struct EventHub {
    broadcast_tx: broadcast::Sender<OfficeEvent>,
}

impl EventHub {
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.broadcast_tx.subscribe(),
        }
    }
}

/// Spawn the single-consumer pump. Must be called inside a runtime.
pub fn spawn_event_pump(log: Arc<EventLog>) -> (mpsc::UnboundedSender<OfficeEvent>, EventHub) {
    spawn_event_pump_with_capacity(log, FANOUT_CAPACITY)
}

pub fn spawn_event_pump_with_capacity(
    log: Arc<EventLog>,
    capacity: usize,
) -> (mpsc::UnboundedSender<OfficeEvent>, EventHub) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OfficeEvent>();
    let (broadcast_tx, _) = broadcast::channel(capacity.max(1));
    let fanout = broadcast_tx.clone();
    tokio::spawn(async move {
        let mut iteration = 0u64;
        while let Some(event) = rx.recv().await {
            if let OfficeEvent::IterationStarted { iteration: n } = &event {
                iteration = *n;
            }
            log.append(event.clone(), iteration);
            let _ = fanout.send(event);
        }
    });
    (tx, EventHub { broadcast_tx })
}

pub struct EventSubscription {
    rx: broadcast::Receiver<OfficeEvent>,
}

impl EventSubscription {
    /// Next event. A lagging reader gets a synthesized SlowObserver and
    /// then resumes from the oldest event still in its buffer. None once
    /// the office is gone.
    pub async fn recv(&mut self) -> Option<OfficeEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                Some(OfficeEvent::SlowObserver { missed })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}
