//! Device state registry
//!
//! [`DeviceState`] is the single record of what the host knows about its
//! controller and itself: identities, controller capabilities, the device
//! flag set and the credit pools. It is created when the host is built and
//! shared by `Arc` with every component.
//!
//! Controller information is only meaningful once bring-up has set
//! [`DevFlags::READY`]; [`DeviceState::controller_info`] refuses to hand it
//! out before that.

use crate::config::HostConfig;
use crate::error::{HciError, Result};
use crate::flags::AtomicFlags;
use crate::flow::FlowControl;
use crate::gap::{AddressType, BdAddr, LeAddr};
use crate::hci::constants::*;
use bitflags::bitflags;
use log::{debug, info};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Size of the vendor supported features area
pub const VS_FEAT_MAX: usize = 1;
/// Size of the vendor supported commands area
pub const VS_CMDS_MAX: usize = 2;
/// Longest device name accepted
pub const DEVICE_NAME_MAX: usize = 248;

bitflags! {
    /// Device wide state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DevFlags: u32 {
        const ENABLE = 1 << 0;
        const READY = 1 << 1;
        /// Identities were provided by the application, storage is not consulted
        const PRESET_ID = 1 << 2;
        const SCANNING = 1 << 3;
        const EXPLICIT_SCAN = 1 << 4;
        const ACTIVE_SCAN = 1 << 5;
        const SCAN_FILTER_DUP = 1 << 6;
        const RPA_VALID = 1 << 7;
        /// Identity data changed and must be written to storage
        const STORE_ID = 1 << 8;

        /// Flags that survive a controller reset
        const PERSISTENT = Self::ENABLE.bits() | Self::PRESET_ID.bits();
    }
}

/// Vendor firmware version reported by the vendor extension commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VsVersion {
    pub hw_platform: u16,
    pub hw_variant: u16,
    pub fw_variant: u8,
    pub fw_version: u8,
    pub fw_revision: u16,
    pub fw_build: u32,
}

/// Controller capabilities collected during bring-up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerInfo {
    pub hci_version: u8,
    pub hci_revision: u16,
    pub lmp_version: u8,
    pub lmp_subversion: u16,
    pub manufacturer: u16,
    /// LMP features, page 0
    pub features: [u8; 8],
    pub le_features: [u8; 8],
    pub supported_commands: [u8; 64],
    pub vs_version: Option<VsVersion>,
    pub vs_features: [u8; VS_FEAT_MAX],
    pub vs_commands: [u8; VS_CMDS_MAX],
    pub public_addr: BdAddr,
    pub acl_mtu: u16,
    pub acl_pkts: u16,
    pub le_acl_mtu: u16,
    pub le_acl_pkts: u8,
    pub iso_mtu: u16,
    pub iso_pkts: u8,
}

impl Default for ControllerInfo {
    fn default() -> Self {
        Self {
            hci_version: 0,
            hci_revision: 0,
            lmp_version: 0,
            lmp_subversion: 0,
            manufacturer: 0,
            features: [0; 8],
            le_features: [0; 8],
            supported_commands: [0; 64],
            vs_version: None,
            vs_features: [0; VS_FEAT_MAX],
            vs_commands: [0; VS_CMDS_MAX],
            public_addr: BdAddr::ANY,
            acl_mtu: 0,
            acl_pkts: 0,
            le_acl_mtu: 0,
            le_acl_pkts: 0,
            iso_mtu: 0,
            iso_pkts: 0,
        }
    }
}

fn bit_set(bytes: &[u8], (octet, mask): (usize, u8)) -> bool {
    bytes.get(octet).map_or(false, |b| b & mask != 0)
}

impl ControllerInfo {
    pub fn has_feature(&self, feature: (usize, u8)) -> bool {
        bit_set(&self.features, feature)
    }

    pub fn has_le_feature(&self, feature: (usize, u8)) -> bool {
        bit_set(&self.le_features, feature)
    }

    pub fn supports_command(&self, command: (usize, u8)) -> bool {
        bit_set(&self.supported_commands, command)
    }

    pub fn le_capable(&self) -> bool {
        self.has_feature(FEAT_LE_SUPPORTED)
    }

    pub fn bredr_capable(&self) -> bool {
        !self.has_feature(FEAT_BREDR_NOT_SUPPORTED)
    }
}

/// Shared device state
#[derive(Debug)]
pub struct DeviceState {
    flags: AtomicFlags<DevFlags>,
    id_max: usize,
    max_connections: usize,
    identities: RwLock<Vec<LeAddr>>,
    irks: RwLock<Vec<Option<[u8; 16]>>>,
    info: RwLock<ControllerInfo>,
    random_addr: RwLock<LeAddr>,
    name: RwLock<String>,
    connections: AtomicUsize,
    flow: Arc<FlowControl>,
}

impl DeviceState {
    pub fn new(config: &HostConfig, flow: Arc<FlowControl>) -> Self {
        Self {
            flags: AtomicFlags::default(),
            id_max: config.id_max,
            max_connections: config.max_connections,
            identities: RwLock::new(Vec::new()),
            irks: RwLock::new(Vec::new()),
            info: RwLock::new(ControllerInfo::default()),
            random_addr: RwLock::new(LeAddr::ANY),
            name: RwLock::new(config.device_name.clone()),
            connections: AtomicUsize::new(0),
            flow,
        }
    }

    /// The device flag set, with atomic test-and-set/test-and-clear
    pub fn flags(&self) -> &AtomicFlags<DevFlags> {
        &self.flags
    }

    pub fn is_ready(&self) -> bool {
        self.flags.contains(DevFlags::READY)
    }

    pub fn flow(&self) -> &Arc<FlowControl> {
        &self.flow
    }

    /// Forget everything a controller reset invalidates
    pub fn reset_transient_state(&self) {
        self.flags.retain(DevFlags::PERSISTENT);
        *self.write_info() = ControllerInfo::default();
        *self.random_addr.write().unwrap_or_else(|e| e.into_inner()) = LeAddr::ANY;
        self.connections.store(0, Ordering::SeqCst);
        debug!("device transient state reset, flags now {:?}", self.flags.load());
    }

    /// Snapshot of the controller information, available once ready
    pub fn controller_info(&self) -> Result<ControllerInfo> {
        if !self.is_ready() {
            return Err(HciError::Precondition("controller not ready"));
        }
        Ok(self.read_info().clone())
    }

    pub(crate) fn read_info(&self) -> RwLockReadGuard<'_, ControllerInfo> {
        self.info.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn write_info(&self) -> RwLockWriteGuard<'_, ControllerInfo> {
        self.info.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn identities(&self) -> Vec<LeAddr> {
        self.identities.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn identity(&self, id: usize) -> Option<LeAddr> {
        self.identities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .copied()
    }

    pub fn id_count(&self) -> usize {
        self.identities.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn check_identity(&self, addr: &LeAddr, existing: &[LeAddr]) -> Result<()> {
        match addr.kind {
            AddressType::Public | AddressType::PublicIdentity if !addr.is_any() => {}
            AddressType::Random | AddressType::RandomIdentity if addr.addr.is_static_random() => {}
            _ => {
                return Err(HciError::InvalidInput(format!(
                    "{} is not a valid identity address",
                    addr
                )))
            }
        }
        if existing.contains(addr) {
            return Err(HciError::InvalidInput(format!("identity {} already exists", addr)));
        }
        if existing.len() >= self.id_max {
            return Err(HciError::Busy("identity slots exhausted"));
        }
        Ok(())
    }

    /// Add an identity address, returning its index
    ///
    /// Once the device is ready the change is flagged for storage.
    pub fn add_identity(&self, addr: LeAddr) -> Result<usize> {
        let id = {
            let mut identities = self.identities.write().unwrap_or_else(|e| e.into_inner());
            self.check_identity(&addr, &identities)?;
            identities.push(addr);
            identities.len() - 1
        };
        self.irks.write().unwrap_or_else(|e| e.into_inner()).resize(id + 1, None);

        if self.is_ready() {
            self.flags.set(DevFlags::STORE_ID);
        }
        info!("identity {} added: {}", id, addr);
        Ok(id)
    }

    /// Install an application provided identity before the stack is enabled
    ///
    /// Stored identities are ignored afterwards.
    pub fn preset_identity(&self, addr: LeAddr) -> Result<usize> {
        if self.flags.contains(DevFlags::ENABLE) {
            return Err(HciError::Precondition("identities must be preset before enable"));
        }
        let id = self.add_identity(addr)?;
        self.flags.set(DevFlags::PRESET_ID);
        Ok(id)
    }

    /// Replace all identities with ones loaded from storage
    pub(crate) fn load_identities(&self, addrs: Vec<LeAddr>) {
        let count = addrs.len().min(self.id_max);
        let mut identities = self.identities.write().unwrap_or_else(|e| e.into_inner());
        *identities = addrs.into_iter().take(count).collect();
        self.irks.write().unwrap_or_else(|e| e.into_inner()).resize(count, None);
    }

    pub fn irk(&self, id: usize) -> Option<[u8; 16]> {
        self.irks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .copied()
            .flatten()
    }

    pub fn set_irk(&self, id: usize, irk: [u8; 16]) -> Result<()> {
        let mut irks = self.irks.write().unwrap_or_else(|e| e.into_inner());
        let slot = irks
            .get_mut(id)
            .ok_or_else(|| HciError::InvalidInput(format!("no identity {}", id)))?;
        *slot = Some(irk);
        Ok(())
    }

    /// IRKs of all identities, unset ones as zeros
    pub fn irks(&self) -> Vec<[u8; 16]> {
        self.irks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|irk| irk.unwrap_or([0; 16]))
            .collect()
    }

    pub fn random_address(&self) -> LeAddr {
        *self.random_addr.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_random_address(&self, addr: LeAddr) {
        *self.random_addr.write().unwrap_or_else(|e| e.into_inner()) = addr;
    }

    pub fn name(&self) -> String {
        self.name.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_name(&self, name: &str) -> Result<()> {
        if name.len() > DEVICE_NAME_MAX {
            return Err(HciError::InvalidInput(format!(
                "device name longer than {} bytes",
                DEVICE_NAME_MAX
            )));
        }
        *self.name.write().unwrap_or_else(|e| e.into_inner()) = name.to_string();
        if self.is_ready() {
            self.flags.set(DevFlags::STORE_ID);
        }
        Ok(())
    }

    pub fn conn_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn has_free_conn_slot(&self) -> bool {
        self.conn_count() < self.max_connections
    }

    pub(crate) fn connection_opened(&self) -> usize {
        self.connections.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn connection_closed(&self) -> usize {
        let prev = self
            .connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id_max: usize) -> DeviceState {
        let config = HostConfig {
            id_max,
            ..HostConfig::default()
        };
        DeviceState::new(&config, Arc::new(FlowControl::new()))
    }

    #[test]
    fn test_reset_keeps_only_persistent_flags() {
        let device = device(1);
        device.flags().set(
            DevFlags::ENABLE | DevFlags::PRESET_ID | DevFlags::READY | DevFlags::SCANNING | DevFlags::STORE_ID,
        );
        device.write_info().hci_version = 0x0C;

        device.reset_transient_state();
        assert_eq!(device.flags().load(), DevFlags::ENABLE | DevFlags::PRESET_ID);
        assert_eq!(device.read_info().hci_version, 0);
    }

    #[test]
    fn test_controller_info_requires_ready() {
        let device = device(1);
        assert!(matches!(
            device.controller_info(),
            Err(HciError::Precondition(_))
        ));
        device.flags().set(DevFlags::READY);
        assert!(device.controller_info().is_ok());
    }

    #[test]
    fn test_identity_bounds_and_validation() {
        let device = device(2);
        let public = LeAddr::public(BdAddr::new([1, 2, 3, 4, 5, 6]));
        assert_eq!(device.add_identity(public).unwrap(), 0);
        assert!(matches!(
            device.add_identity(public),
            Err(HciError::InvalidInput(_))
        ));
        // Not a static random address
        assert!(device
            .add_identity(LeAddr::random(BdAddr::new([1, 2, 3, 4, 5, 0x46])))
            .is_err());

        let random = LeAddr::random(BdAddr::new_static_random());
        assert_eq!(device.add_identity(random).unwrap(), 1);
        let err = device
            .add_identity(LeAddr::random(BdAddr::new_static_random()))
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(device.identities(), vec![public, random]);
    }

    #[test]
    fn test_preset_identity_only_before_enable() {
        let device = device(1);
        let addr = LeAddr::random(BdAddr::new_static_random());
        device.preset_identity(addr).unwrap();
        assert!(device.flags().contains(DevFlags::PRESET_ID));
        assert!(!device.flags().contains(DevFlags::STORE_ID));

        let device = self::device(1);
        device.flags().set(DevFlags::ENABLE);
        assert!(device.preset_identity(addr).is_err());
    }

    #[test]
    fn test_store_flag_after_ready() {
        let device = device(1);
        device.flags().set(DevFlags::READY);
        device
            .add_identity(LeAddr::public(BdAddr::new([1, 2, 3, 4, 5, 6])))
            .unwrap();
        assert!(device.flags().test_and_clear(DevFlags::STORE_ID));

        device.set_irk(0, [7; 16]).unwrap();
        assert_eq!(device.irk(0), Some([7; 16]));
        assert!(device.set_irk(3, [0; 16]).is_err());

        device.set_name("sensor").unwrap();
        assert!(device.flags().contains(DevFlags::STORE_ID));
        assert!(device.set_name(&"x".repeat(DEVICE_NAME_MAX + 1)).is_err());
    }

    #[test]
    fn test_connection_counting() {
        let device = device(1);
        assert!(device.has_free_conn_slot());
        assert_eq!(device.connection_opened(), 1);
        assert!(!device.has_free_conn_slot());
        assert_eq!(device.connection_closed(), 0);
        assert_eq!(device.connection_closed(), 0);
        assert!(device.has_free_conn_slot());
    }

    #[test]
    fn test_controller_info_bits() {
        let mut info = ControllerInfo::default();
        assert!(info.bredr_capable());
        assert!(!info.le_capable());
        info.features[4] = 0x60;
        assert!(info.le_capable());
        assert!(!info.bredr_capable());
        info.supported_commands[41] = 0x20;
        assert!(info.supports_command(CMD_LE_READ_BUFFER_SIZE_V2));
        assert!(!info.supports_command(CMD_LE_ENCRYPT));
    }
}
