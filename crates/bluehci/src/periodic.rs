//! Periodic advertising sync objects
//!
//! A sync moves `CREATED -> SYNCING -> SYNCED` and is released when it is
//! cancelled, terminated, lost or fails to establish. Only one create-sync
//! may be outstanding at a time.
//!
//! Report fragments of a synced train are reassembled into a bounded
//! buffer. Once a report is known to be incomplete every further fragment
//! is dropped until the next complete boundary, so memory never grows past
//! the configured buffer size.

use crate::config::HostConfig;
use crate::device::DeviceState;
use crate::error::{HciError, Result};
use crate::event::{EventSink, HostEvent};
use crate::flags::AtomicFlags;
use crate::gap::LeAddr;
use crate::hci::constants::*;
use crate::hci::dispatch::Dispatcher;
use crate::hci::events::{PerAdvReport, PerAdvSyncEstablished, PerAdvSyncLost};
use crate::hci::packet::HciCommand;
use bitflags::bitflags;
use log::{debug, info, trace, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

bitflags! {
    /// Sync object state
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncFlags: u32 {
        const CREATED = 1 << 0;
        const SYNCING = 1 << 1;
        /// Syncing to any advertiser on the periodic advertiser list
        const SYNCING_USE_LIST = 1 << 2;
        const SYNCED = 1 << 3;
        const RECV_DISABLED = 1 << 4;
        const CTE_ENABLED = 1 << 5;
    }
}

/// Parameters of a create-sync request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncParams {
    /// Ignored when `use_list` is set
    pub advertiser: LeAddr,
    pub sid: u8,
    /// Periodic events the controller may skip
    pub skip: u16,
    /// Supervision timeout, 10 ms units
    pub timeout: u16,
    pub use_list: bool,
    /// Establish the sync with reports disabled
    pub reports_disabled: bool,
}

impl SyncParams {
    pub fn new(advertiser: LeAddr, sid: u8) -> Self {
        Self {
            advertiser,
            sid,
            skip: 0,
            timeout: 1000,
            use_list: false,
            reports_disabled: false,
        }
    }
}

/// What is known about a sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncInfo {
    pub advertiser: LeAddr,
    pub sid: u8,
    /// Controller handle, once synced
    pub handle: Option<u16>,
    /// 1.25 ms units
    pub interval: u16,
    pub phy: u8,
    pub clock_accuracy: u8,
}

/// Bounded reassembly of periodic and extended advertising report fragments
#[derive(Debug, Default)]
pub struct Reassembly {
    buf: Vec<u8>,
    capacity: usize,
    truncated: bool,
}

impl Reassembly {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            truncated: false,
        }
    }

    /// True while fragments are being dropped up to the next complete one
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.truncated = false;
    }

    /// Feed one fragment, returning a finished report
    ///
    /// With a zero capacity every fragment is passed through unchanged.
    pub fn push(&mut self, data_status: u8, data: &[u8]) -> Option<Vec<u8>> {
        if self.capacity == 0 {
            return Some(data.to_vec());
        }

        if self.truncated {
            if data_status == DATA_STATUS_COMPLETE {
                self.truncated = false;
                self.buf.clear();
            }
            return None;
        }

        let fits = self.buf.len() + data.len() <= self.capacity;
        match data_status {
            DATA_STATUS_PARTIAL if fits => {
                self.buf.extend_from_slice(data);
                None
            }
            DATA_STATUS_COMPLETE if fits => {
                let mut report = std::mem::take(&mut self.buf);
                report.extend_from_slice(data);
                Some(report)
            }
            DATA_STATUS_COMPLETE => {
                debug!("report of {} bytes dropped", self.buf.len() + data.len());
                self.buf.clear();
                None
            }
            _ => {
                self.truncated = true;
                self.buf.clear();
                None
            }
        }
    }
}

/// One sync object
pub struct PeriodicSync {
    index: usize,
    flags: AtomicFlags<SyncFlags>,
    info: Mutex<SyncInfo>,
    reassembly: Mutex<Reassembly>,
    ops: Mutex<()>,
}

impl std::fmt::Debug for PeriodicSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicSync")
            .field("index", &self.index)
            .field("flags", &self.flags.load())
            .finish()
    }
}

impl PeriodicSync {
    fn info(&self) -> MutexGuard<'_, SyncInfo> {
        self.info.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reassembly(&self) -> MutexGuard<'_, Reassembly> {
        self.reassembly.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handle(&self) -> Option<u16> {
        self.info().handle
    }
}

/// Owner of every periodic sync object
pub struct PeriodicSyncs {
    device: Arc<DeviceState>,
    dispatcher: Arc<Dispatcher>,
    events: EventSink,
    timeout: Duration,
    buf_size: usize,
    slots: Mutex<Vec<Option<Arc<PeriodicSync>>>>,
}

impl std::fmt::Debug for PeriodicSyncs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicSyncs").field("syncs", &self.syncs()).finish()
    }
}

impl PeriodicSyncs {
    pub fn new(config: &HostConfig, device: Arc<DeviceState>, dispatcher: Arc<Dispatcher>, events: EventSink) -> Arc<Self> {
        let syncs = Arc::new(Self {
            device,
            dispatcher: dispatcher.clone(),
            events,
            timeout: config.command_timeout(),
            buf_size: config.per_adv_sync_buf_size,
            slots: Mutex::new(vec![None; config.per_adv_sync_max]),
        });

        let weak = Arc::downgrade(&syncs);
        dispatcher.register_le_handler(
            EVT_LE_PER_ADV_SYNC_ESTABLISHED,
            Box::new(move |event| {
                let Some(syncs) = weak.upgrade() else { return };
                match PerAdvSyncEstablished::parse(event) {
                    Some(evt) => syncs.on_established(&evt),
                    None => warn!("malformed periodic sync established event"),
                }
            }),
        );
        let weak = Arc::downgrade(&syncs);
        dispatcher.register_le_handler(
            EVT_LE_PER_ADVERTISING_REPORT,
            Box::new(move |event| {
                let Some(syncs) = weak.upgrade() else { return };
                match PerAdvReport::parse(event) {
                    Some(report) => syncs.on_report(&report),
                    None => warn!("malformed periodic advertising report"),
                }
            }),
        );
        let weak = Arc::downgrade(&syncs);
        dispatcher.register_le_handler(
            EVT_LE_PER_ADV_SYNC_LOST,
            Box::new(move |event| {
                let Some(syncs) = weak.upgrade() else { return };
                match PerAdvSyncLost::parse(event) {
                    Some(evt) => syncs.on_lost(evt.sync_handle),
                    None => warn!("malformed periodic sync lost event"),
                }
            }),
        );
        syncs
    }

    fn lock_slots(&self) -> MutexGuard<'_, Vec<Option<Arc<PeriodicSync>>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn syncs(&self) -> Vec<Arc<PeriodicSync>> {
        self.lock_slots().iter().flatten().cloned().collect()
    }

    fn lookup(&self, index: usize) -> Result<Arc<PeriodicSync>> {
        self.lock_slots()
            .get(index)
            .cloned()
            .flatten()
            .ok_or_else(|| HciError::InvalidInput(format!("unknown periodic sync {}", index)))
    }

    fn by_handle(&self, handle: u16) -> Option<Arc<PeriodicSync>> {
        self.syncs()
            .into_iter()
            .find(|sync| sync.flags.contains(SyncFlags::SYNCED) && sync.handle() == Some(handle))
    }

    fn pending(&self) -> Option<Arc<PeriodicSync>> {
        self.syncs().into_iter().find(|sync| sync.flags.contains(SyncFlags::SYNCING))
    }

    fn release(&self, sync: &Arc<PeriodicSync>) {
        sync.flags.clear_all();
        let mut slots = self.lock_slots();
        if let Some(slot) = slots.get_mut(sync.index) {
            if slot.as_ref().map_or(false, |current| Arc::ptr_eq(current, sync)) {
                *slot = None;
            }
        }
    }

    pub fn flags(&self, index: usize) -> Option<SyncFlags> {
        self.lookup(index).ok().map(|sync| sync.flags.load())
    }

    pub fn info(&self, index: usize) -> Option<SyncInfo> {
        self.lookup(index).ok().map(|sync| sync.info().clone())
    }

    /// Whether the sync is dropping fragments of an incomplete report
    pub fn is_truncated(&self, index: usize) -> Option<bool> {
        self.lookup(index).ok().map(|sync| sync.reassembly().is_truncated())
    }

    /// Ask the controller to synchronize to a periodic train
    ///
    /// Returns the index of the new sync object. Establishment is reported
    /// later through [`HostEvent::SyncEstablished`] or
    /// [`HostEvent::SyncTerminated`].
    pub fn create_sync(&self, params: &SyncParams) -> Result<usize> {
        if !self.device.is_ready() {
            return Err(HciError::Precondition("controller not ready"));
        }
        if !self.device.read_info().has_le_feature(LE_FEAT_PER_ADV) {
            return Err(HciError::Unsupported);
        }
        if params.sid > 0x0F {
            return Err(HciError::InvalidInput(format!("invalid advertising SID {}", params.sid)));
        }
        if !(0x000A..=0x4000).contains(&params.timeout) || params.skip > 0x01F3 {
            return Err(HciError::InvalidInput("invalid sync skip or timeout".into()));
        }

        let mut flags = SyncFlags::CREATED | SyncFlags::SYNCING;
        let mut options = 0;
        if params.use_list {
            flags |= SyncFlags::SYNCING_USE_LIST;
            options |= PER_ADV_SYNC_OPT_USE_LIST;
        }
        if params.reports_disabled {
            flags |= SyncFlags::RECV_DISABLED;
            options |= PER_ADV_SYNC_OPT_REPORTS_DISABLED;
        }

        let sync = {
            let mut slots = self.lock_slots();
            if slots.iter().flatten().any(|sync| sync.flags.contains(SyncFlags::SYNCING)) {
                return Err(HciError::Busy("periodic sync creation pending"));
            }
            let index = slots
                .iter()
                .position(Option::is_none)
                .ok_or(HciError::Busy("no free periodic sync object"))?;
            // SYNCING goes up before the command so a quick establishment finds it
            let sync = Arc::new(PeriodicSync {
                index,
                flags: AtomicFlags::new(flags),
                info: Mutex::new(SyncInfo {
                    advertiser: params.advertiser,
                    sid: params.sid,
                    handle: None,
                    interval: 0,
                    phy: 0,
                    clock_accuracy: 0,
                }),
                reassembly: Mutex::new(Reassembly::new(self.buf_size)),
                ops: Mutex::new(()),
            });
            slots[index] = Some(sync.clone());
            sync
        };

        let sent = self.dispatcher.command(
            &HciCommand::LePeriodicAdvCreateSync {
                options,
                sid: params.sid,
                addr_type: params.advertiser.type_byte(),
                address: params.advertiser.addr.bytes,
                skip: params.skip,
                sync_timeout: params.timeout,
                cte_type: 0,
            },
            self.timeout,
        );
        if let Err(e) = sent {
            self.release(&sync);
            return Err(e);
        }
        debug!("periodic sync {} to {} sid {} pending", sync.index, params.advertiser, params.sid);
        Ok(sync.index)
    }

    /// Abort a pending create-sync
    pub fn cancel(&self, index: usize) -> Result<()> {
        let sync = self.lookup(index)?;
        let _op = sync.ops.lock().unwrap_or_else(|e| e.into_inner());
        if !sync.flags.contains(SyncFlags::SYNCING) {
            return Err(HciError::Precondition("periodic sync not pending"));
        }
        self.dispatcher
            .command(&HciCommand::LePeriodicAdvCreateSyncCancel, self.timeout)?;

        // The controller still reports the cancelled establishment; with the
        // object gone that report is ignored.
        self.release(&sync);
        self.events.emit(HostEvent::SyncTerminated {
            index,
            reason: HCI_ERR_OP_CANCELLED_BY_HOST,
        });
        Ok(())
    }

    /// Stop an established sync
    pub fn terminate(&self, index: usize) -> Result<()> {
        let sync = self.lookup(index)?;
        let _op = sync.ops.lock().unwrap_or_else(|e| e.into_inner());
        let handle = match sync.handle() {
            Some(handle) if sync.flags.contains(SyncFlags::SYNCED) => handle,
            _ => return Err(HciError::Precondition("periodic sync not established")),
        };
        self.dispatcher
            .command(&HciCommand::LePeriodicAdvTerminateSync { handle }, self.timeout)?;

        self.release(&sync);
        info!("periodic sync {} terminated", index);
        self.events.emit(HostEvent::SyncTerminated {
            index,
            reason: HCI_ERR_LOCALHOST_TERM_CONN,
        });
        Ok(())
    }

    /// Cancel, terminate or simply free a sync, whichever its state calls for
    pub fn delete(&self, index: usize) -> Result<()> {
        let flags = self.lookup(index)?.flags.load();
        if flags.contains(SyncFlags::SYNCING) {
            self.cancel(index)
        } else if flags.contains(SyncFlags::SYNCED) {
            self.terminate(index)
        } else {
            let sync = self.lookup(index)?;
            self.release(&sync);
            Ok(())
        }
    }

    /// Turn report delivery on or off for an established sync
    pub fn set_receive_enabled(&self, index: usize, enable: bool) -> Result<()> {
        let sync = self.lookup(index)?;
        let _op = sync.ops.lock().unwrap_or_else(|e| e.into_inner());
        let handle = match sync.handle() {
            Some(handle) if sync.flags.contains(SyncFlags::SYNCED) => handle,
            _ => return Err(HciError::Precondition("periodic sync not established")),
        };
        self.dispatcher.command(
            &HciCommand::LeSetPeriodicAdvReceiveEnable { handle, enable },
            self.timeout,
        )?;

        if enable {
            sync.flags.clear(SyncFlags::RECV_DISABLED);
        } else {
            sync.flags.set(SyncFlags::RECV_DISABLED);
            sync.reassembly().clear();
        }
        Ok(())
    }

    fn on_established(&self, evt: &PerAdvSyncEstablished) {
        let Some(sync) = self.pending() else {
            if evt.status == HCI_SUCCESS {
                // Nobody asked for this one; hand it back
                warn!("unexpected periodic sync 0x{:04x}, terminating", evt.sync_handle);
                if let Err(e) = self.dispatcher.queue_command(HciCommand::LePeriodicAdvTerminateSync {
                    handle: evt.sync_handle,
                }) {
                    warn!("failed to queue sync terminate: {}", e);
                }
            } else {
                trace!("sync established 0x{:02x} with no pending sync", evt.status);
            }
            return;
        };

        if evt.status != HCI_SUCCESS {
            debug!("periodic sync {} failed: 0x{:02x}", sync.index, evt.status);
            self.release(&sync);
            self.events.emit(HostEvent::SyncTerminated {
                index: sync.index,
                reason: evt.status,
            });
            return;
        }

        {
            let mut info = sync.info();
            info.advertiser = evt.advertiser;
            info.sid = evt.sid;
            info.handle = Some(evt.sync_handle);
            info.interval = evt.interval;
            info.phy = evt.phy;
            info.clock_accuracy = evt.clock_accuracy;
        }
        sync.flags.clear(SyncFlags::SYNCING | SyncFlags::SYNCING_USE_LIST);
        sync.flags.set(SyncFlags::SYNCED);
        info!("periodic sync {} established, handle 0x{:04x}", sync.index, evt.sync_handle);
        self.events.emit(HostEvent::SyncEstablished {
            index: sync.index,
            sync_handle: evt.sync_handle,
            advertiser: evt.advertiser,
            sid: evt.sid,
            interval: evt.interval,
            phy: evt.phy,
        });
    }

    fn on_report(&self, report: &PerAdvReport) {
        let Some(sync) = self.by_handle(report.sync_handle) else {
            trace!("periodic report for unknown sync 0x{:04x}", report.sync_handle);
            return;
        };
        if sync.flags.contains(SyncFlags::RECV_DISABLED) {
            return;
        }

        let assembled = sync.reassembly().push(report.data_status, &report.data);
        let Some(data) = assembled else { return };
        let data_status = if self.buf_size == 0 {
            report.data_status
        } else {
            DATA_STATUS_COMPLETE
        };
        self.events.emit(HostEvent::PeriodicReport {
            index: sync.index,
            sync_handle: report.sync_handle,
            tx_power: report.tx_power,
            rssi: report.rssi,
            data_status,
            data,
        });
    }

    fn on_lost(&self, handle: u16) {
        let Some(sync) = self.by_handle(handle) else {
            warn!("sync lost for unknown handle 0x{:04x}", handle);
            return;
        };
        info!("periodic sync {} lost", sync.index);
        self.release(&sync);
        self.events.emit(HostEvent::SyncLost {
            index: sync.index,
            sync_handle: handle,
        });
    }

    /// Drop every sync object; the controller forgot them on reset
    pub fn on_stack_reset(&self) {
        let mut slots = self.lock_slots();
        for slot in slots.iter_mut() {
            if let Some(sync) = slot.take() {
                sync.flags.clear_all();
                debug!("periodic sync {} dropped by reset", sync.index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gap::BdAddr;
    use crate::testing::{le_meta, Profile, Stack};

    fn advertiser() -> LeAddr {
        LeAddr::random(BdAddr::new([1, 2, 3, 4, 5, 0xC6]))
    }

    fn setup(buf_size: usize) -> (Stack, Arc<PeriodicSyncs>) {
        let config = HostConfig {
            per_adv_sync_buf_size: buf_size,
            ..HostConfig::default()
        };
        let stack = Stack::ready(config, Profile::default());
        let syncs = PeriodicSyncs::new(
            &stack.config,
            stack.device.clone(),
            stack.dispatcher.clone(),
            stack.events.clone(),
        );
        (stack, syncs)
    }

    fn established(status: u8, handle: u16) -> Vec<u8> {
        let mut params = vec![status];
        params.extend_from_slice(&handle.to_le_bytes());
        params.push(3);
        params.extend_from_slice(&advertiser().to_bytes());
        params.push(0x02);
        params.extend_from_slice(&0x0050u16.to_le_bytes());
        params.push(0x05);
        le_meta(EVT_LE_PER_ADV_SYNC_ESTABLISHED, &params)
    }

    fn report(handle: u16, status: u8, data: &[u8]) -> Vec<u8> {
        let mut params = handle.to_le_bytes().to_vec();
        params.extend_from_slice(&[0x7F, 0xD0, 0xFF, status, data.len() as u8]);
        params.extend_from_slice(data);
        le_meta(EVT_LE_PER_ADVERTISING_REPORT, &params)
    }

    fn synced(stack: &Stack, syncs: &PeriodicSyncs, handle: u16) -> usize {
        let index = syncs.create_sync(&SyncParams::new(advertiser(), 3)).unwrap();
        stack.inject(&established(HCI_SUCCESS, handle));
        index
    }

    fn reports(stack: &Stack) -> Vec<Vec<u8>> {
        stack
            .events()
            .into_iter()
            .filter_map(|event| match event {
                HostEvent::PeriodicReport { data, .. } => Some(data),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_reassembly_concatenates_fragments() {
        let mut reassembly = Reassembly::new(16);
        assert_eq!(reassembly.push(DATA_STATUS_PARTIAL, &[1, 2]), None);
        assert_eq!(reassembly.push(DATA_STATUS_PARTIAL, &[3]), None);
        assert_eq!(reassembly.push(DATA_STATUS_COMPLETE, &[4, 5]), Some(vec![1, 2, 3, 4, 5]));
        // The buffer starts over
        assert_eq!(reassembly.push(DATA_STATUS_COMPLETE, &[6]), Some(vec![6]));
    }

    #[test]
    fn test_reassembly_drops_until_complete_boundary() {
        let mut reassembly = Reassembly::new(16);
        assert_eq!(reassembly.push(DATA_STATUS_PARTIAL, &[1, 2]), None);
        assert_eq!(reassembly.push(DATA_STATUS_INCOMPLETE, &[]), None);
        assert!(reassembly.is_truncated());
        assert_eq!(reassembly.push(DATA_STATUS_PARTIAL, &[3]), None);
        assert_eq!(reassembly.push(DATA_STATUS_COMPLETE, &[4]), None);
        assert!(!reassembly.is_truncated());
        assert_eq!(reassembly.push(DATA_STATUS_COMPLETE, &[5]), Some(vec![5]));
    }

    #[test]
    fn test_reassembly_overflow() {
        let mut reassembly = Reassembly::new(4);
        assert_eq!(reassembly.push(DATA_STATUS_PARTIAL, &[1, 2, 3]), None);
        assert_eq!(reassembly.push(DATA_STATUS_PARTIAL, &[4, 5]), None);
        assert!(reassembly.is_truncated());
        assert_eq!(reassembly.push(DATA_STATUS_COMPLETE, &[6]), None);

        // A complete report that does not fit is dropped on its own
        assert_eq!(reassembly.push(DATA_STATUS_PARTIAL, &[1, 2]), None);
        assert_eq!(reassembly.push(DATA_STATUS_COMPLETE, &[3, 4, 5]), None);
        assert!(!reassembly.is_truncated());
        assert_eq!(reassembly.push(DATA_STATUS_COMPLETE, &[1, 2, 3, 4]), Some(vec![1, 2, 3, 4]));
    }

    #[test]
    fn test_reassembly_disabled_passes_fragments() {
        let mut reassembly = Reassembly::new(0);
        assert_eq!(reassembly.push(DATA_STATUS_PARTIAL, &[1]), Some(vec![1]));
        assert_eq!(reassembly.push(DATA_STATUS_INCOMPLETE, &[2]), Some(vec![2]));
        assert!(!reassembly.is_truncated());
    }

    #[test]
    fn test_sync_established_and_reports() {
        let (stack, syncs) = setup(64);
        let index = synced(&stack, &syncs, 0x0101);

        assert!(syncs.flags(index).unwrap().contains(SyncFlags::CREATED | SyncFlags::SYNCED));
        let info = syncs.info(index).unwrap();
        assert_eq!(info.handle, Some(0x0101));
        assert_eq!(info.interval, 0x0050);
        assert_eq!(info.phy, 0x02);
        assert!(stack.events().contains(&HostEvent::SyncEstablished {
            index,
            sync_handle: 0x0101,
            advertiser: advertiser(),
            sid: 3,
            interval: 0x0050,
            phy: 0x02,
        }));

        stack.inject(&report(0x0101, DATA_STATUS_PARTIAL, &[1, 2]));
        stack.inject(&report(0x0101, DATA_STATUS_PARTIAL, &[3]));
        stack.inject(&report(0x0101, DATA_STATUS_COMPLETE, &[4]));
        stack.inject(&report(0x0101, DATA_STATUS_PARTIAL, &[9]));
        stack.inject(&report(0x0101, DATA_STATUS_INCOMPLETE, &[]));
        assert_eq!(syncs.is_truncated(index), Some(true));
        stack.inject(&report(0x0101, DATA_STATUS_COMPLETE, &[10]));
        assert_eq!(syncs.is_truncated(index), Some(false));
        // Reports for other handles are ignored
        stack.inject(&report(0x0202, DATA_STATUS_COMPLETE, &[7]));

        assert_eq!(reports(&stack), vec![vec![1, 2, 3, 4]]);
    }

    #[test]
    fn test_second_create_is_busy() {
        let config = HostConfig {
            per_adv_sync_max: 2,
            ..HostConfig::default()
        };
        let stack = Stack::ready(config, Profile::default());
        let syncs = PeriodicSyncs::new(
            &stack.config,
            stack.device.clone(),
            stack.dispatcher.clone(),
            stack.events.clone(),
        );

        let params = SyncParams::new(advertiser(), 3);
        syncs.create_sync(&params).unwrap();
        assert!(matches!(syncs.create_sync(&params), Err(HciError::Busy(_))));
    }

    #[test]
    fn test_failed_establishment_releases_sync() {
        let (stack, syncs) = setup(0);
        let index = syncs.create_sync(&SyncParams::new(advertiser(), 3)).unwrap();
        assert!(syncs.flags(index).unwrap().contains(SyncFlags::SYNCING));

        stack.inject(&established(0x3E, 0));
        assert_eq!(syncs.flags(index), None);
        assert!(stack
            .events()
            .contains(&HostEvent::SyncTerminated { index, reason: 0x3E }));

        // The slot is free again
        assert_eq!(syncs.create_sync(&SyncParams::new(advertiser(), 3)).unwrap(), index);
    }

    #[test]
    fn test_create_failure_leaves_no_object() {
        let (stack, syncs) = setup(0);
        stack.responder.fail(OP_LE_PER_ADV_CREATE_SYNC, 0x0C);
        assert!(matches!(
            syncs.create_sync(&SyncParams::new(advertiser(), 3)),
            Err(HciError::CommandFailed { status: 0x0C, .. })
        ));
        assert_eq!(syncs.flags(0), None);
    }

    #[test]
    fn test_cancel_and_terminate() {
        let (stack, syncs) = setup(0);
        let index = syncs.create_sync(&SyncParams::new(advertiser(), 3)).unwrap();
        assert!(matches!(syncs.terminate(index), Err(HciError::Precondition(_))));
        syncs.cancel(index).unwrap();
        assert_eq!(syncs.flags(index), None);
        // The late cancelled establishment finds nothing to act on
        stack.inject(&established(HCI_ERR_OP_CANCELLED_BY_HOST, 0));

        let index = synced(&stack, &syncs, 0x0033);
        assert!(matches!(syncs.cancel(index), Err(HciError::Precondition(_))));
        syncs.set_receive_enabled(index, false).unwrap();
        stack.inject(&report(0x0033, DATA_STATUS_COMPLETE, &[1]));
        assert!(reports(&stack).is_empty());

        syncs.delete(index).unwrap();
        assert_eq!(syncs.flags(index), None);
        let terminate = opcode(OGF_LE, OCF_LE_PER_ADV_TERMINATE_SYNC);
        assert_eq!(stack.responder.last_params(terminate), Some(vec![0x33, 0x00]));
        assert!(stack.events().contains(&HostEvent::SyncTerminated {
            index,
            reason: HCI_ERR_LOCALHOST_TERM_CONN,
        }));
    }

    #[test]
    fn test_sync_lost() {
        let (stack, syncs) = setup(32);
        let index = synced(&stack, &syncs, 0x0044);
        stack.inject(&report(0x0044, DATA_STATUS_PARTIAL, &[1, 2, 3]));

        stack.inject(&le_meta(EVT_LE_PER_ADV_SYNC_LOST, &0x0044u16.to_le_bytes()));
        assert_eq!(syncs.flags(index), None);
        assert!(stack.events().contains(&HostEvent::SyncLost {
            index,
            sync_handle: 0x0044,
        }));
        assert!(reports(&stack).is_empty());
    }
}
