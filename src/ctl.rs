//! Local control channel events.

use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::Address;

/// The transport carries an A2DP stream.
pub const PCM_TYPE_A2DP: u16 = 1 << 0;
/// The transport carries an SCO voice link.
pub const PCM_TYPE_SCO: u16 = 1 << 1;
/// The transport plays back local PCM data.
pub const PCM_STREAM_PLAYBACK: u16 = 1 << 8;
/// The transport captures remote PCM data.
pub const PCM_STREAM_CAPTURE: u16 = 1 << 9;

/// Transport lifecycle event kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventKind {
    /// A transport was added to its device.
    TransportAdded,
    /// A transport was removed from its device.
    TransportRemoved,
}

/// Transport lifecycle event sent to the local event consumer.
///
/// Events for a single transport are delivered in the order of the
/// corresponding state changes. There is no ordering between transports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransportEvent {
    /// Event kind.
    pub kind: EventKind,
    /// Address of the remote device.
    pub addr: Address,
    /// Stream type mask composed of `PCM_TYPE_*` and `PCM_STREAM_*` bits.
    pub mask: u16,
}

/// Fan-out of transport events to all local subscribers.
pub(crate) struct CtlEmitter {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
}

impl CtlEmitter {
    pub fn new() -> Self {
        Self { subscribers: Mutex::new(Vec::new()) }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn emit(&self, event: TransportEvent) {
        log::trace!("Event: {:?}", &event);
        self.subscribers.lock().unwrap().retain(|tx| tx.send(event).is_ok());
    }
}
