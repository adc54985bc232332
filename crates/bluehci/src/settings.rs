//! Identity persistence
//!
//! The host stores a handful of values in an external key/value store,
//! addressed by path strings:
//!
//! - `bt/id`: every identity, 7 bytes each (type followed by the address)
//! - `bt/irk`: the IRK of every identity, 16 bytes each
//! - `bt/name`: the device name
//!
//! Per-peer entries use [`encode_key`], which appends the peer address as
//! 12 hex digits (most significant byte first) and a one-digit address type,
//! e.g. `bt/keys/aabbccddeeff0`.

use crate::device::{DevFlags, DeviceState};
use crate::error::{HciError, Result};
use crate::gap::{AddressType, BdAddr, LeAddr};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const KEY_ID: &str = "bt/id";
pub const KEY_IRK: &str = "bt/irk";
pub const KEY_NAME: &str = "bt/name";

/// Length of the address segment of an encoded key
const ADDR_SEGMENT_LEN: usize = 13;

/// Key/value store the identity data lives in
pub trait SettingsStore: Send + Sync {
    fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, path: &str, value: &[u8]) -> Result<()>;
    fn delete(&self, path: &str) -> Result<()>;
}

/// Volatile store, mostly for tests and for hosts without storage
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SettingsStore for MemoryStore {
    fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(path).cloned())
    }

    fn put(&self, path: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(path.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(path);
        Ok(())
    }
}

/// One file per path under a root directory
///
/// File names are the hex encoding of the path, so any path maps to a single
/// flat file name.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| HciError::Storage(format!("cannot create {}: {}", root.display(), e)))?;
        Ok(Self { root })
    }

    fn file_for(&self, path: &str) -> PathBuf {
        self.root.join(hex::encode(path.as_bytes()))
    }
}

impl SettingsStore for FileStore {
    fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.file_for(path)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HciError::Storage(format!("read {}: {}", path, e))),
        }
    }

    fn put(&self, path: &str, value: &[u8]) -> Result<()> {
        let file = self.file_for(path);
        let tmp = file.with_extension("tmp");
        fs::write(&tmp, value)
            .and_then(|_| fs::rename(&tmp, &file))
            .map_err(|e| HciError::Storage(format!("write {}: {}", path, e)))
    }

    fn delete(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.file_for(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HciError::Storage(format!("delete {}: {}", path, e))),
        }
    }
}

/// Build the storage path of a per-address entry
pub fn encode_key(subsys: &str, addr: &LeAddr, key: Option<&str>) -> String {
    let mut msb_first = addr.addr.bytes;
    msb_first.reverse();
    let mut path = format!("bt/{}/{}{}", subsys, hex::encode(msb_first), addr.type_byte());
    if let Some(key) = key {
        path.push('/');
        path.push_str(key);
    }
    path
}

/// Decode the address segment of a per-address entry
///
/// `segment` is the part after the subsystem, optionally followed by `/key`.
pub fn decode_key(segment: &str) -> Result<LeAddr> {
    let name = segment.split('/').next().unwrap_or("");
    if name.len() != ADDR_SEGMENT_LEN || !name.is_ascii() {
        return Err(HciError::InvalidInput(format!(
            "invalid address segment length {} in {:?}",
            name.len(),
            segment
        )));
    }

    let kind = match &name[12..] {
        "0" => AddressType::Public,
        "1" => AddressType::Random,
        other => {
            return Err(HciError::InvalidInput(format!(
                "invalid address type {:?} in {:?}",
                other, segment
            )))
        }
    };

    let mut bytes = [0u8; 6];
    hex::decode_to_slice(&name[..12], &mut bytes)
        .map_err(|e| HciError::InvalidInput(format!("invalid address in {:?}: {}", segment, e)))?;
    bytes.reverse();
    Ok(LeAddr::new(kind, BdAddr::new(bytes)))
}

/// Split a full per-address path into subsystem, address and optional key
pub fn decode_path(path: &str) -> Result<(String, LeAddr, Option<String>)> {
    let rest = path
        .strip_prefix("bt/")
        .ok_or_else(|| HciError::InvalidInput(format!("not a bt path: {:?}", path)))?;
    let (subsys, segment) = rest
        .split_once('/')
        .ok_or_else(|| HciError::InvalidInput(format!("missing address in {:?}", path)))?;
    let addr = decode_key(segment)?;
    let key = segment.split_once('/').map(|(_, key)| key.to_string());
    Ok((subsys.to_string(), addr, key))
}

/// Bridge between [`DeviceState`] identity fields and a [`SettingsStore`]
#[derive(Clone)]
pub struct IdentityStore {
    store: Arc<dyn SettingsStore>,
}

impl std::fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityStore").finish_non_exhaustive()
    }
}

impl IdentityStore {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SettingsStore> {
        &self.store
    }

    /// Load identities, IRKs and name into `device`
    ///
    /// Nothing is loaded unless the stack is enabled, and preset identities
    /// are never overwritten. Returns the number of identities loaded.
    pub fn load(&self, device: &DeviceState) -> Result<usize> {
        let flags = device.flags().load();
        if !flags.contains(DevFlags::ENABLE) {
            debug!("stack not enabled, skipping settings load");
            return Ok(0);
        }

        if let Some(name) = self.store.get(KEY_NAME)? {
            match String::from_utf8(name) {
                Ok(name) => device.set_name(&name)?,
                Err(_) => warn!("ignoring stored device name that is not UTF-8"),
            }
        }

        if flags.contains(DevFlags::PRESET_ID) {
            debug!("identities preset, ignoring stored identities");
            return Ok(0);
        }

        let Some(ids) = self.store.get(KEY_ID)? else {
            return Ok(0);
        };
        if ids.is_empty() || ids.len() % 7 != 0 {
            error!("invalid length {} of stored identities, ignoring", ids.len());
            return Ok(0);
        }
        let addrs: Vec<LeAddr> = ids.chunks(7).filter_map(LeAddr::from_bytes).collect();
        let count = addrs.len();
        device.load_identities(addrs);

        if let Some(irks) = self.store.get(KEY_IRK)? {
            if irks.len() % 16 != 0 {
                error!("invalid length {} of stored IRKs, ignoring", irks.len());
            } else {
                for (id, chunk) in irks.chunks(16).enumerate().take(device.id_count()) {
                    let mut irk = [0u8; 16];
                    irk.copy_from_slice(chunk);
                    if irk != [0; 16] {
                        device.set_irk(id, irk)?;
                    }
                }
            }
        }

        info!("loaded {} identities from storage", count);
        Ok(count)
    }

    /// Write identities, IRKs and name
    pub fn save(&self, device: &DeviceState) -> Result<()> {
        let ids: Vec<u8> = device.identities().iter().flat_map(|id| id.to_bytes()).collect();
        self.store.put(KEY_ID, &ids)?;

        let irks: Vec<u8> = device.irks().concat();
        if irks.iter().any(|&b| b != 0) {
            self.store.put(KEY_IRK, &irks)?;
        } else {
            self.store.delete(KEY_IRK)?;
        }

        self.store.put(KEY_NAME, device.name().as_bytes())?;
        debug!("saved {} identities", device.id_count());
        Ok(())
    }

    /// Save if the device flagged its identity data as changed
    pub fn commit(&self, device: &DeviceState) -> Result<bool> {
        if !device.flags().test_and_clear(DevFlags::STORE_ID) {
            return Ok(false);
        }
        if let Err(e) = self.save(device) {
            // Keep the flag so the next commit retries
            device.flags().set(DevFlags::STORE_ID);
            return Err(e);
        }
        Ok(true)
    }
}
