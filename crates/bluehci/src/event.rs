//! Events delivered to the layers above the host core

use crate::gap::{LeAddr, Role};
use log::trace;
use std::sync::{Arc, Mutex, RwLock};

/// A decoded advertising report from a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingReport {
    pub event_type: u8,
    pub address: LeAddr,
    pub rssi: i8,
    /// AD structures as `(type, data)` pairs
    pub data: Vec<(u8, Vec<u8>)>,
}

/// Events emitted by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// Bring-up finished; the first identity is ready for use
    Ready { identity: Option<LeAddr> },
    /// Bring-up stopped at `opcode`; `status` is absent for transport failures
    BringUpFailed { opcode: u16, status: Option<u8> },
    Connected {
        handle: u16,
        role: Role,
        peer: LeAddr,
        /// Advertising set the connection came from, for peripheral connections
        adv_handle: Option<u8>,
        /// Local identity used by that advertising set
        identity: Option<u8>,
    },
    Disconnected { handle: u16, reason: u8 },
    AdvertisingReport(AdvertisingReport),
    AdvertisingSetTerminated {
        adv_handle: u8,
        status: u8,
        conn_handle: Option<u16>,
        completed_events: u8,
    },
    SyncEstablished {
        index: usize,
        sync_handle: u16,
        advertiser: LeAddr,
        sid: u8,
        interval: u16,
        phy: u8,
    },
    PeriodicReport {
        index: usize,
        sync_handle: u16,
        tx_power: i8,
        rssi: i8,
        data_status: u8,
        data: Vec<u8>,
    },
    SyncLost { index: usize, sync_handle: u16 },
    /// Sync object released by cancel, terminate or a failed establishment
    SyncTerminated { index: usize, reason: u8 },
    HardwareError { code: u8 },
    DataBufferOverflow { link_type: u8 },
}

/// A callback function for host events
pub type EventCallback = Arc<Mutex<dyn FnMut(&HostEvent) + Send + 'static>>;

/// Fan-out point for [`HostEvent`]s, cheap to clone
#[derive(Clone, Default)]
pub struct EventSink {
    callback: Arc<RwLock<Option<EventCallback>>>,
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let installed = self.callback.read().map(|cb| cb.is_some()).unwrap_or(false);
        f.debug_struct("EventSink").field("installed", &installed).finish()
    }
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_callback(&self, callback: EventCallback) {
        *self.callback.write().unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    pub fn emit(&self, event: HostEvent) {
        let callback = self.callback.read().unwrap_or_else(|e| e.into_inner()).clone();
        match callback {
            Some(callback) => {
                let mut callback = callback.lock().unwrap_or_else(|e| e.into_inner());
                (*callback)(&event);
            }
            None => trace!("no event callback for {:?}", event),
        }
    }
}

/// Receiver of security related controller events
///
/// Pairing itself happens outside the host core; it only gets the events.
pub trait PairingHandler: Send + Sync {
    fn encryption_changed(&self, _handle: u16, _status: u8, _enabled: bool) {}

    fn ltk_requested(&self, _handle: u16, _rand: u64, _ediv: u16) {}
}
