//! Extended advertising sets
//!
//! Each set walks `CREATED -> PARAMS_SET -> DATA_SET -> ENABLED`. The
//! host-side flags are checked before anything is sent, so a request that
//! breaks the order fails with a precondition error and the controller never
//! sees it. Controller failures leave the set in the state it had before the
//! request.
//!
//! Requests from the application block on the controller and hold the set's
//! operation lock for their whole duration. The dispatch context only
//! touches the atomic flags and the short-lived state lock; whatever has to
//! talk to the controller afterwards (restart, removal, limit expiry, RPA
//! rotation) runs on the [`Scheduler`].

use crate::config::HostConfig;
use crate::device::{DevFlags, DeviceState};
use crate::error::{HciError, Result};
use crate::event::{EventSink, HostEvent};
use crate::flags::AtomicFlags;
use crate::gap::*;
use crate::hci::constants::*;
use crate::hci::dispatch::{Completion, Dispatcher};
use crate::hci::events::{AdvSetTerminated, LeConnectionComplete};
use crate::hci::packet::{ExtAdvEnableSet, ExtAdvParameters, HciCommand};
use crate::work::{Scheduler, WorkKey};
use bitflags::bitflags;
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

bitflags! {
    /// Advertising set state
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AdvFlags: u32 {
        const CREATED = 1 << 0;
        const PARAMS_SET = 1 << 1;
        const DATA_SET = 1 << 2;
        /// The set's random address must be written before the next enable
        const RANDOM_ADDR_PENDING = 1 << 3;
        const RPA_VALID = 1 << 4;
        /// A rotation is waiting for the set to be disabled
        const RPA_UPDATE = 1 << 5;
        const LIMITED = 1 << 6;
        const ENABLED = 1 << 7;
        const INCLUDE_NAME = 1 << 8;
        const CONNECTABLE = 1 << 9;
        const SCANNABLE = 1 << 10;
        const EXT_ADV = 1 << 11;
        const USE_IDENTITY = 1 << 12;
        const PERSIST = 1 << 13;
        const PAUSED = 1 << 14;

        /// Flags derived from [`AdvOptions`]
        const OPTIONS = Self::INCLUDE_NAME.bits()
            | Self::CONNECTABLE.bits()
            | Self::SCANNABLE.bits()
            | Self::EXT_ADV.bits()
            | Self::USE_IDENTITY.bits()
            | Self::PERSIST.bits();
    }
}

bitflags! {
    /// Options chosen by the application for a set
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AdvOptions: u32 {
        const CONNECTABLE = 1 << 0;
        const SCANNABLE = 1 << 1;
        /// Extended PDUs; legacy PDUs otherwise
        const EXT_ADV = 1 << 2;
        /// Advertise with the identity address even when privacy is on
        const USE_IDENTITY = 1 << 3;
        /// Put the device name in the advertising or scan response data
        const USE_NAME = 1 << 4;
        /// Restart after a connection is made from the set
        const PERSIST = 1 << 5;
    }
}

impl AdvOptions {
    fn to_flags(self) -> AdvFlags {
        let mut flags = AdvFlags::empty();
        for (option, flag) in [
            (AdvOptions::CONNECTABLE, AdvFlags::CONNECTABLE),
            (AdvOptions::SCANNABLE, AdvFlags::SCANNABLE),
            (AdvOptions::EXT_ADV, AdvFlags::EXT_ADV),
            (AdvOptions::USE_IDENTITY, AdvFlags::USE_IDENTITY),
            (AdvOptions::USE_NAME, AdvFlags::INCLUDE_NAME),
            (AdvOptions::PERSIST, AdvFlags::PERSIST),
        ] {
            if self.contains(option) {
                flags |= flag;
            }
        }
        flags
    }
}

/// Advertising parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvParams {
    /// Local identity to advertise as
    pub id: usize,
    pub options: AdvOptions,
    /// 0.625 ms units
    pub interval_min: u32,
    pub interval_max: u32,
    pub sid: u8,
    /// dBm, 127 for no preference
    pub tx_power: i8,
}

impl Default for AdvParams {
    fn default() -> Self {
        Self {
            id: 0,
            options: AdvOptions::CONNECTABLE,
            interval_min: ADV_FAST_INT_MIN_2,
            interval_max: ADV_FAST_INT_MAX_2,
            sid: 0,
            tx_power: 127,
        }
    }
}

impl AdvParams {
    pub fn new(options: AdvOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }
}

/// Encode `(type, data)` pairs as AD structures
pub fn encode_advertising_data(structures: &[(u8, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (ad_type, data) in structures {
        out.push((data.len() + 1) as u8);
        out.push(*ad_type);
        out.extend_from_slice(data);
    }
    out
}

#[derive(Debug, Default)]
struct SetState {
    params: Option<AdvParams>,
    ad: Vec<u8>,
    sd: Vec<u8>,
    address: Option<LeAddr>,
    /// Duration and event limits of the last enable
    limits: (u16, u8),
    /// Bumped on every enable and disable, checked by stale timers
    generation: u64,
}

/// One advertising set
pub struct AdvSet {
    handle: u8,
    flags: AtomicFlags<AdvFlags>,
    ops: Mutex<()>,
    state: Mutex<SetState>,
}

impl std::fmt::Debug for AdvSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvSet")
            .field("handle", &self.handle)
            .field("flags", &self.flags.load())
            .finish()
    }
}

impl AdvSet {
    fn new(handle: u8) -> Self {
        Self {
            handle,
            flags: AtomicFlags::new(AdvFlags::CREATED),
            ops: Mutex::new(()),
            state: Mutex::new(SetState::default()),
        }
    }

    pub fn handle(&self) -> u8 {
        self.handle
    }

    pub fn flags(&self) -> AdvFlags {
        self.flags.load()
    }

    fn state(&self) -> MutexGuard<'_, SetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Serializes multi-command transitions; never taken in the dispatch context
    fn serialize(&self) -> MutexGuard<'_, ()> {
        self.ops.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn identity_id(&self) -> usize {
        self.state().params.as_ref().map_or(0, |p| p.id)
    }
}

/// Owner of every advertising set
pub struct Advertising {
    this: Weak<Advertising>,
    device: Arc<DeviceState>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<Scheduler>,
    events: EventSink,
    timeout: Duration,
    rpa_timeout: Duration,
    privacy: bool,
    slots: Mutex<Vec<Option<Arc<AdvSet>>>>,
    /// Peripheral connections waiting for their set terminated event
    connections: Mutex<HashMap<u16, LeConnectionComplete>>,
    paused_all: AtomicBool,
}

impl std::fmt::Debug for Advertising {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Advertising").field("sets", &self.sets()).finish()
    }
}

impl Advertising {
    pub fn new(
        config: &HostConfig,
        device: Arc<DeviceState>,
        dispatcher: Arc<Dispatcher>,
        scheduler: Arc<Scheduler>,
        events: EventSink,
    ) -> Arc<Self> {
        let adv = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            device,
            dispatcher: dispatcher.clone(),
            scheduler,
            events,
            timeout: config.command_timeout(),
            rpa_timeout: config.rpa_timeout(),
            privacy: config.privacy,
            slots: Mutex::new(vec![None; config.adv_set_max]),
            connections: Mutex::new(HashMap::new()),
            paused_all: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&adv);
        dispatcher.register_le_handler(
            EVT_LE_ADV_SET_TERMINATED,
            Box::new(move |event| {
                let Some(adv) = weak.upgrade() else { return };
                match AdvSetTerminated::parse(event) {
                    Some(evt) => adv.on_set_terminated(&evt),
                    None => warn!("malformed advertising set terminated event"),
                }
            }),
        );
        adv
    }

    fn lock_slots(&self) -> MutexGuard<'_, Vec<Option<Arc<AdvSet>>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_connections(&self) -> MutexGuard<'_, HashMap<u16, LeConnectionComplete>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sets(&self) -> Vec<Arc<AdvSet>> {
        self.lock_slots().iter().flatten().cloned().collect()
    }

    fn lookup(&self, handle: u8) -> Result<Arc<AdvSet>> {
        self.lock_slots()
            .get(handle as usize)
            .cloned()
            .flatten()
            .filter(|set| set.flags.contains(AdvFlags::CREATED))
            .ok_or_else(|| HciError::InvalidInput(format!("unknown advertising set {}", handle)))
    }

    fn command(&self, command: HciCommand) -> Result<Completion> {
        self.dispatcher.command(&command, self.timeout)
    }

    /// Current flags of a set, if its slot is in use
    pub fn flags(&self, handle: u8) -> Option<AdvFlags> {
        self.lock_slots()
            .get(handle as usize)
            .and_then(|slot| slot.as_ref().map(|set| set.flags()))
    }

    /// Address the set advertises with, once known
    pub fn address(&self, handle: u8) -> Option<LeAddr> {
        self.lookup(handle).ok().and_then(|set| set.state().address)
    }

    /// Allocate a set, returning its handle
    pub fn create(&self) -> Result<u8> {
        if !self.device.is_ready() {
            return Err(HciError::Precondition("controller not ready"));
        }
        if !self.device.read_info().has_le_feature(LE_FEAT_EXT_ADV) {
            return Err(HciError::Unsupported);
        }

        let mut slots = self.lock_slots();
        let handle = slots
            .iter()
            .position(Option::is_none)
            .ok_or(HciError::Busy("no free advertising set"))?;
        slots[handle] = Some(Arc::new(AdvSet::new(handle as u8)));
        debug!("advertising set {} created", handle);
        Ok(handle as u8)
    }

    /// Send the advertising parameters for a disabled set
    pub fn set_params(&self, handle: u8, params: AdvParams) -> Result<()> {
        let set = self.lookup(handle)?;
        let _op = set.serialize();
        if set.flags.contains(AdvFlags::ENABLED) {
            return Err(HciError::Precondition("advertising set is enabled"));
        }
        self.apply_params(&set, params)
    }

    fn apply_params(&self, set: &AdvSet, mut params: AdvParams) -> Result<()> {
        let identity = self
            .device
            .identity(params.id)
            .ok_or_else(|| HciError::InvalidInput(format!("no identity {}", params.id)))?;
        if params.interval_min < 0x20 || params.interval_min > params.interval_max || params.interval_max > 0xFF_FFFF {
            return Err(HciError::InvalidInput(format!(
                "invalid advertising interval {}..{}",
                params.interval_min, params.interval_max
            )));
        }

        let legacy = !params.options.contains(AdvOptions::EXT_ADV);
        if legacy && params.options.contains(AdvOptions::CONNECTABLE) {
            params.options |= AdvOptions::SCANNABLE;
        }
        if !legacy && params.options.contains(AdvOptions::CONNECTABLE | AdvOptions::SCANNABLE) {
            return Err(HciError::InvalidInput(
                "extended advertising cannot be connectable and scannable".into(),
            ));
        }

        let mut properties = 0;
        if params.options.contains(AdvOptions::CONNECTABLE) {
            properties |= EXT_ADV_PROP_CONNECTABLE;
        }
        if params.options.contains(AdvOptions::SCANNABLE) {
            properties |= EXT_ADV_PROP_SCANNABLE;
        }
        if legacy {
            properties |= EXT_ADV_PROP_LEGACY;
        }

        let use_rpa = self.privacy && !params.options.contains(AdvOptions::USE_IDENTITY);
        let random = use_rpa || matches!(identity.kind, AddressType::Random | AddressType::RandomIdentity);
        let own_addr_type = if random {
            RANDOM_DEVICE_ADDRESS
        } else {
            PUBLIC_DEVICE_ADDRESS
        };

        self.command(HciCommand::LeSetExtAdvParameters(ExtAdvParameters {
            handle: set.handle,
            properties,
            interval_min: params.interval_min,
            interval_max: params.interval_max,
            channel_map: 0x07,
            own_addr_type,
            peer_addr_type: 0,
            peer_addr: [0; 6],
            filter_policy: 0,
            tx_power: params.tx_power,
            primary_phy: 0x01,
            secondary_max_skip: 0,
            secondary_phy: 0x01,
            sid: params.sid,
            scan_req_notify: false,
        }))?;

        set.flags.clear(AdvFlags::OPTIONS | AdvFlags::RPA_VALID);
        set.flags.set(params.options.to_flags() | AdvFlags::PARAMS_SET);
        set.flags.assign(AdvFlags::RANDOM_ADDR_PENDING, random);

        let mut state = set.state();
        state.address = if random { None } else { Some(identity) };
        state.params = Some(params);
        trace!("advertising set {} parameters set", set.handle);
        Ok(())
    }

    /// Set advertising and scan response data
    ///
    /// The device name is appended when the set was configured with
    /// [`AdvOptions::USE_NAME`].
    pub fn set_data(&self, handle: u8, ad: &[(u8, Vec<u8>)], sd: &[(u8, Vec<u8>)]) -> Result<()> {
        let set = self.lookup(handle)?;
        let _op = set.serialize();
        let flags = set.flags.load();
        if !flags.contains(AdvFlags::PARAMS_SET) {
            return Err(HciError::Precondition("advertising parameters not set"));
        }

        let mut ad = ad.to_vec();
        let mut sd = sd.to_vec();
        if flags.contains(AdvFlags::INCLUDE_NAME) {
            let name = (ADV_TYPE_COMPLETE_LOCAL_NAME, self.device.name().into_bytes());
            if flags.contains(AdvFlags::SCANNABLE) {
                sd.push(name);
            } else {
                ad.push(name);
            }
        }
        if !sd.is_empty() && !flags.contains(AdvFlags::SCANNABLE) {
            return Err(HciError::InvalidInput("scan response data for a non-scannable set".into()));
        }

        let max = if flags.contains(AdvFlags::EXT_ADV) {
            EXT_ADV_DATA_MAX
        } else {
            LEGACY_ADV_DATA_MAX
        };
        let ad = encode_advertising_data(&ad);
        let sd = encode_advertising_data(&sd);
        if ad.len() > max || sd.len() > max {
            return Err(HciError::InvalidInput(format!("advertising data exceeds {} bytes", max)));
        }

        self.write_data(&set, &ad, &sd)?;
        set.flags.set(AdvFlags::DATA_SET);
        let mut state = set.state();
        state.ad = ad;
        state.sd = sd;
        Ok(())
    }

    fn write_data(&self, set: &AdvSet, ad: &[u8], sd: &[u8]) -> Result<()> {
        self.command(HciCommand::LeSetExtAdvData {
            handle: set.handle,
            data: ad.to_vec(),
        })?;
        if set.flags.contains(AdvFlags::SCANNABLE) {
            self.command(HciCommand::LeSetExtScanResponseData {
                handle: set.handle,
                data: sd.to_vec(),
            })?;
        }
        Ok(())
    }

    /// Enable a set
    ///
    /// `duration` (10 ms units) and `max_events` limit the advertising;
    /// either being non-zero makes the set `LIMITED`.
    pub fn start(&self, handle: u8, duration: u16, max_events: u8) -> Result<()> {
        let set = self.lookup(handle)?;
        let _op = set.serialize();
        self.enable_locked(&set, duration, max_events)
    }

    fn enable_locked(&self, set: &AdvSet, duration: u16, max_events: u8) -> Result<()> {
        let flags = set.flags.load();
        if flags.contains(AdvFlags::ENABLED) {
            return Err(HciError::Precondition("advertising set already enabled"));
        }
        if !flags.contains(AdvFlags::PARAMS_SET | AdvFlags::DATA_SET) {
            return Err(HciError::Precondition("advertising parameters and data must be set first"));
        }
        if flags.contains(AdvFlags::CONNECTABLE) && !self.device.has_free_conn_slot() {
            return Err(HciError::Busy("no free connection slot"));
        }

        self.update_address(set)?;

        let limited = duration != 0 || max_events != 0;
        let enabled = if limited {
            AdvFlags::ENABLED | AdvFlags::LIMITED
        } else {
            AdvFlags::ENABLED
        };
        // Flags go up first so a quick set terminated event finds them
        let prev = set.flags.update(enabled, AdvFlags::PAUSED);
        let sent = self.command(HciCommand::LeSetExtAdvEnable {
            enable: true,
            sets: vec![ExtAdvEnableSet {
                handle: set.handle,
                duration,
                max_events,
            }],
        });
        if let Err(e) = sent {
            set.flags.update(prev & AdvFlags::PAUSED, enabled);
            return Err(e);
        }

        let generation = {
            let mut state = set.state();
            state.generation += 1;
            state.limits = (duration, max_events);
            state.generation
        };
        if duration != 0 {
            self.arm_limit_timer(set.handle, generation, Duration::from_millis(duration as u64 * 10));
        }
        info!("advertising set {} enabled", set.handle);
        Ok(())
    }

    fn disable_locked(&self, set: &AdvSet) -> Result<()> {
        if !set.flags.contains(AdvFlags::ENABLED) {
            return Ok(());
        }
        self.command(HciCommand::LeSetExtAdvEnable {
            enable: false,
            sets: vec![ExtAdvEnableSet {
                handle: set.handle,
                duration: 0,
                max_events: 0,
            }],
        })?;
        set.flags.clear(AdvFlags::ENABLED | AdvFlags::LIMITED);
        self.scheduler.cancel(WorkKey::AdvTimeout(set.handle));
        set.state().generation += 1;
        info!("advertising set {} disabled", set.handle);
        Ok(())
    }

    /// Disable a set, keeping its configuration
    pub fn stop(&self, handle: u8) -> Result<()> {
        let set = self.lookup(handle)?;
        let _op = set.serialize();
        self.disable_locked(&set)?;
        set.flags.clear(AdvFlags::PAUSED);
        Ok(())
    }

    /// Disable and remove a set, freeing its slot
    pub fn delete(&self, handle: u8) -> Result<()> {
        let set = self.lookup(handle)?;
        let _op = set.serialize();
        self.disable_locked(&set)?;
        if set.flags.contains(AdvFlags::PARAMS_SET) {
            self.command(HciCommand::LeRemoveAdvSet { handle })?;
        }
        set.flags.clear_all();
        self.free_slot(&set);
        debug!("advertising set {} deleted", handle);
        Ok(())
    }

    fn free_slot(&self, set: &Arc<AdvSet>) {
        for key in [WorkKey::AdvTimeout(set.handle), WorkKey::AdvRestart(set.handle)] {
            self.scheduler.cancel(key);
        }
        let mut slots = self.lock_slots();
        if let Some(slot) = slots.get_mut(set.handle as usize) {
            if slot.as_ref().map_or(false, |current| Arc::ptr_eq(current, set)) {
                *slot = None;
            }
        }
    }

    /// Write the set's random address if it changed; only while disabled
    fn update_address(&self, set: &AdvSet) -> Result<()> {
        let flags = set.flags.load();
        let use_rpa = self.privacy && !flags.contains(AdvFlags::USE_IDENTITY);
        let id = set.identity_id();

        let address = if use_rpa {
            if flags.contains(AdvFlags::RPA_VALID) && !flags.intersects(AdvFlags::RPA_UPDATE | AdvFlags::RANDOM_ADDR_PENDING) {
                return Ok(());
            }
            let irk = self
                .device
                .irk(id)
                .ok_or(HciError::Precondition("identity has no IRK"))?;
            LeAddr::random(self.generate_rpa(&irk)?)
        } else {
            if !flags.contains(AdvFlags::RANDOM_ADDR_PENDING) {
                return Ok(());
            }
            self.device
                .identity(id)
                .ok_or_else(|| HciError::InvalidInput(format!("no identity {}", id)))?
        };

        self.command(HciCommand::LeSetAdvSetRandomAddress {
            handle: set.handle,
            address: address.addr.bytes,
        })?;
        set.flags.clear(AdvFlags::RANDOM_ADDR_PENDING | AdvFlags::RPA_UPDATE);
        if use_rpa {
            set.flags.set(AdvFlags::RPA_VALID);
            self.device.flags().set(DevFlags::RPA_VALID);
            self.arm_rotation();
        }
        set.state().address = Some(address);
        debug!("advertising set {} address {}", set.handle, address);
        Ok(())
    }

    /// Resolvable private address for `irk`, hashed by the controller
    fn generate_rpa(&self, irk: &[u8; 16]) -> Result<BdAddr> {
        if !self.device.read_info().supports_command(CMD_LE_ENCRYPT) {
            return Err(HciError::Unsupported);
        }

        let mut prand: [u8; 3] = rand::random();
        prand[2] = (prand[2] & 0x3F) | 0x40;
        let mut plaintext = [0u8; 16];
        plaintext[..3].copy_from_slice(&prand);

        let completion = self.command(HciCommand::LeEncrypt { key: *irk, plaintext })?;
        let payload = completion.payload();
        let hash = payload
            .get(..3)
            .ok_or(HciError::InvalidParamLength(payload.len()))?;

        let mut bytes = [0u8; 6];
        bytes[..3].copy_from_slice(hash);
        bytes[3..].copy_from_slice(&prand);
        Ok(BdAddr::new(bytes))
    }

    fn arm_limit_timer(&self, handle: u8, generation: u64, delay: Duration) {
        let weak = self.this.clone();
        self.scheduler.schedule(WorkKey::AdvTimeout(handle), delay, move || {
            if let Some(adv) = weak.upgrade() {
                adv.limit_expired(handle, generation);
            }
        });
    }

    fn limit_expired(&self, handle: u8, generation: u64) {
        let Ok(set) = self.lookup(handle) else {
            return;
        };
        let _op = set.serialize();
        let current = set.state().generation;
        if current != generation || !set.flags.contains(AdvFlags::ENABLED | AdvFlags::LIMITED) {
            trace!("stale limit timer for advertising set {}", handle);
            return;
        }

        if let Err(e) = self.disable_locked(&set) {
            warn!("failed to stop limited advertising set {}: {}", handle, e);
            return;
        }
        self.terminated(&set, HCI_ERR_ADV_TIMEOUT, None, 0);
    }

    fn arm_rotation(&self) {
        if self.scheduler.is_pending(WorkKey::RpaRotate) {
            return;
        }
        let weak = self.this.clone();
        self.scheduler.schedule(WorkKey::RpaRotate, self.rpa_timeout, move || {
            if let Some(adv) = weak.upgrade() {
                adv.rotate_rpa();
            }
        });
    }

    /// Give every private set a fresh RPA
    ///
    /// Enabled sets are briefly disabled, since the controller only accepts
    /// a new address for an inactive set.
    pub fn rotate_rpa(&self) {
        self.device.flags().clear(DevFlags::RPA_VALID);
        if !self.privacy {
            return;
        }

        for set in self.sets() {
            let _op = set.serialize();
            let flags = set.flags.load();
            if !flags.contains(AdvFlags::CREATED) || flags.contains(AdvFlags::USE_IDENTITY) {
                continue;
            }
            set.flags.clear(AdvFlags::RPA_VALID);
            if !flags.contains(AdvFlags::ENABLED) {
                continue;
            }

            set.flags.set(AdvFlags::RPA_UPDATE);
            let (duration, max_events) = set.state().limits;
            let restarted = self
                .disable_locked(&set)
                .and_then(|_| self.enable_locked(&set, duration, max_events));
            if let Err(e) = restarted {
                warn!("RPA rotation failed for advertising set {}: {}", set.handle, e);
            }
        }
    }

    /// Disable every enabled set, marking it `PAUSED`
    pub fn pause_all(&self) -> Result<()> {
        self.paused_all.store(true, Ordering::SeqCst);
        let mut result = Ok(());
        for set in self.sets() {
            let _op = set.serialize();
            if !set.flags.contains(AdvFlags::ENABLED) {
                continue;
            }
            match self.disable_locked(&set) {
                Ok(()) => set.flags.set(AdvFlags::PAUSED),
                Err(e) => {
                    warn!("failed to pause advertising set {}: {}", set.handle, e);
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        result
    }

    /// Re-enable every `PAUSED` set
    pub fn resume_all(&self) -> Result<()> {
        self.paused_all.store(false, Ordering::SeqCst);
        let mut result = Ok(());
        for set in self.sets() {
            let _op = set.serialize();
            if !set.flags.contains(AdvFlags::PAUSED) {
                continue;
            }
            if let Err(e) = self.resume_locked(&set) {
                warn!("failed to resume advertising set {}: {}", set.handle, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Bring a paused set back, restoring controller state lost to a reset
    fn resume_locked(&self, set: &AdvSet) -> Result<()> {
        if set.flags.contains(AdvFlags::ENABLED) {
            return Ok(());
        }
        if set.flags.contains(AdvFlags::CONNECTABLE) && !self.device.has_free_conn_slot() {
            debug!("advertising set {} stays paused, no free connection slot", set.handle);
            set.flags.set(AdvFlags::PAUSED);
            return Ok(());
        }

        if !set.flags.contains(AdvFlags::PARAMS_SET) {
            let params = set
                .state()
                .params
                .clone()
                .ok_or(HciError::Precondition("advertising parameters not set"))?;
            self.apply_params(set, params)?;
        }
        if !set.flags.contains(AdvFlags::DATA_SET) {
            let (ad, sd) = {
                let state = set.state();
                (state.ad.clone(), state.sd.clone())
            };
            self.write_data(set, &ad, &sd)?;
            set.flags.set(AdvFlags::DATA_SET);
        }

        let (duration, max_events) = set.state().limits;
        self.enable_locked(set, duration, max_events)
    }

    /// Schedule resumption of paused persistent sets
    pub fn schedule_resume(&self) {
        if self.paused_all.load(Ordering::SeqCst) {
            return;
        }
        let waiting = self
            .sets()
            .iter()
            .any(|set| set.flags.contains(AdvFlags::PERSIST | AdvFlags::PAUSED));
        if !waiting {
            return;
        }

        let weak = self.this.clone();
        self.scheduler.schedule(WorkKey::AdvResume, Duration::ZERO, move || {
            let Some(adv) = weak.upgrade() else { return };
            for set in adv.sets() {
                let _op = set.serialize();
                if set.flags.contains(AdvFlags::PERSIST | AdvFlags::PAUSED) {
                    if let Err(e) = adv.resume_locked(&set) {
                        warn!("failed to resume advertising set {}: {}", set.handle, e);
                    }
                }
            }
        });
    }

    /// Hold a peripheral connection until its set reports termination
    ///
    /// Returns false when no advertising set can account for the
    /// connection; the caller reports it directly then.
    pub fn cache_connection(&self, cc: &LeConnectionComplete) -> bool {
        if cc.status != HCI_SUCCESS || cc.role != Role::Peripheral {
            return false;
        }
        if !self.device.read_info().has_le_feature(LE_FEAT_EXT_ADV) {
            return false;
        }
        let advertising = self
            .sets()
            .iter()
            .any(|set| set.flags.contains(AdvFlags::ENABLED | AdvFlags::CONNECTABLE));
        if !advertising {
            return false;
        }
        self.lock_connections().insert(cc.connection_handle, cc.clone());
        true
    }

    /// A connection went away; a slot may be free for a paused set
    pub fn on_disconnected(&self, handle: u16) {
        self.lock_connections().remove(&handle);
        self.schedule_resume();
    }

    fn on_set_terminated(&self, evt: &AdvSetTerminated) {
        let set = match self.lookup(evt.adv_handle) {
            Ok(set) => set,
            Err(_) => {
                warn!("set terminated for unknown advertising set {}", evt.adv_handle);
                return;
            }
        };
        let conn = if evt.status == HCI_SUCCESS {
            self.lock_connections().remove(&evt.conn_handle)
        } else {
            None
        };
        self.terminated(&set, evt.status, conn, evt.num_completed_events);
    }

    /// The set stopped on its own; runs in the dispatch context
    fn terminated(&self, set: &Arc<AdvSet>, status: u8, conn: Option<LeConnectionComplete>, completed_events: u8) {
        set.flags.clear(AdvFlags::ENABLED | AdvFlags::LIMITED);
        self.scheduler.cancel(WorkKey::AdvTimeout(set.handle));
        set.state().generation += 1;
        let id = set.identity_id();
        debug!("advertising set {} terminated, status 0x{:02x}", set.handle, status);

        let conn_handle = conn.as_ref().map(|cc| cc.connection_handle);
        if let Some(cc) = conn {
            // The connection used up the private address
            set.flags.clear(AdvFlags::RPA_VALID);
            self.events.emit(HostEvent::Connected {
                handle: cc.connection_handle,
                role: cc.role,
                peer: cc.peer,
                adv_handle: Some(set.handle),
                identity: Some(id as u8),
            });
        }
        self.events.emit(HostEvent::AdvertisingSetTerminated {
            adv_handle: set.handle,
            status,
            conn_handle,
            completed_events,
        });

        if set.flags.contains(AdvFlags::PERSIST) {
            if conn_handle.is_some() {
                if self.device.has_free_conn_slot() && !self.paused_all.load(Ordering::SeqCst) {
                    let weak = self.this.clone();
                    let handle = set.handle;
                    self.scheduler.schedule(WorkKey::AdvRestart(handle), Duration::ZERO, move || {
                        let Some(adv) = weak.upgrade() else { return };
                        let Ok(set) = adv.lookup(handle) else { return };
                        let _op = set.serialize();
                        if let Err(e) = adv.resume_locked(&set) {
                            warn!("failed to restart advertising set {}: {}", handle, e);
                        }
                    });
                } else {
                    set.flags.set(AdvFlags::PAUSED);
                }
            }
            return;
        }

        // Not persistent: the set is gone once the controller forgets it
        set.flags.clear_all();
        let weak = self.this.clone();
        let doomed = set.clone();
        self.scheduler.schedule(WorkKey::AdvRemove(set.handle), Duration::ZERO, move || {
            let Some(adv) = weak.upgrade() else { return };
            let _op = doomed.serialize();
            if let Err(e) = adv.command(HciCommand::LeRemoveAdvSet { handle: doomed.handle }) {
                warn!("failed to remove advertising set {}: {}", doomed.handle, e);
            }
            adv.free_slot(&doomed);
        });
    }

    /// Forget controller-side state after a controller reset
    ///
    /// Persistent sets survive with their configuration and are resumed
    /// once the controller is ready again; all others are released.
    pub fn on_stack_reset(&self) {
        self.scheduler.cancel(WorkKey::RpaRotate);
        self.lock_connections().clear();

        let mut slots = self.lock_slots();
        for slot in slots.iter_mut() {
            let Some(set) = slot else { continue };
            for key in [
                WorkKey::AdvTimeout(set.handle),
                WorkKey::AdvRestart(set.handle),
                WorkKey::AdvRemove(set.handle),
            ] {
                self.scheduler.cancel(key);
            }

            let flags = set.flags.load();
            if flags.contains(AdvFlags::PERSIST) {
                set.flags.retain(AdvFlags::CREATED | AdvFlags::OPTIONS);
                if flags.intersects(AdvFlags::ENABLED | AdvFlags::PAUSED) {
                    set.flags.set(AdvFlags::PAUSED);
                }
            } else {
                set.flags.clear_all();
                *slot = None;
            }
        }
    }
}
