//! Typed views of the HCI events the host consumes
//!
//! Each parser takes the generic [`HciEvent`] and returns `None` when the
//! event is not of the expected kind or is too short.

use crate::gap::{AddressType, BdAddr, LeAddr, Role};
use crate::hci::constants::*;
use crate::hci::packet::HciEvent;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

fn le_params(event: &HciEvent, subevent: u8) -> Option<Cursor<&[u8]>> {
    if event.le_subevent() != Some(subevent) {
        return None;
    }
    Some(Cursor::new(&event.parameters[1..]))
}

fn read_addr(cursor: &mut Cursor<&[u8]>) -> Option<BdAddr> {
    let mut bytes = [0u8; 6];
    cursor.read_exact(&mut bytes).ok()?;
    Some(BdAddr::new(bytes))
}

/// LE Connection Complete and LE Enhanced Connection Complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeConnectionComplete {
    pub status: u8,
    pub connection_handle: u16,
    pub role: Role,
    pub peer: LeAddr,
    pub local_rpa: Option<BdAddr>,
    pub peer_rpa: Option<BdAddr>,
    pub conn_interval: u16,
    pub conn_latency: u16,
    pub supervision_timeout: u16,
    pub central_clock_accuracy: u8,
}

impl LeConnectionComplete {
    pub fn parse(event: &HciEvent) -> Option<Self> {
        let enhanced = match event.le_subevent()? {
            EVT_LE_CONN_COMPLETE => false,
            EVT_LE_ENH_CONN_COMPLETE => true,
            _ => return None,
        };
        let mut cursor = Cursor::new(&event.parameters[1..]);

        let status = cursor.read_u8().ok()?;
        let connection_handle = cursor.read_u16::<LittleEndian>().ok()? & HCI_HANDLE_MASK;
        let role = Role::from(cursor.read_u8().ok()?);
        let peer_type = AddressType::from(cursor.read_u8().ok()?);
        let peer = LeAddr::new(peer_type, read_addr(&mut cursor)?);
        let (local_rpa, peer_rpa) = if enhanced {
            let local = read_addr(&mut cursor)?;
            let remote = read_addr(&mut cursor)?;
            (Some(local), Some(remote))
        } else {
            (None, None)
        };

        Some(Self {
            status,
            connection_handle,
            role,
            peer,
            local_rpa,
            peer_rpa,
            conn_interval: cursor.read_u16::<LittleEndian>().ok()?,
            conn_latency: cursor.read_u16::<LittleEndian>().ok()?,
            supervision_timeout: cursor.read_u16::<LittleEndian>().ok()?,
            central_clock_accuracy: cursor.read_u8().ok()?,
        })
    }
}

/// Disconnection Complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectionComplete {
    pub status: u8,
    pub connection_handle: u16,
    pub reason: u8,
}

impl DisconnectionComplete {
    pub fn parse(event: &HciEvent) -> Option<Self> {
        if event.event_code != EVT_DISCONN_COMPLETE {
            return None;
        }
        let mut cursor = Cursor::new(&event.parameters[..]);
        Some(Self {
            status: cursor.read_u8().ok()?,
            connection_handle: cursor.read_u16::<LittleEndian>().ok()? & HCI_HANDLE_MASK,
            reason: cursor.read_u8().ok()?,
        })
    }
}

/// Number Of Completed Packets: `(handle, count)` pairs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumCompletedPackets {
    pub entries: Vec<(u16, u16)>,
}

impl NumCompletedPackets {
    pub fn parse(event: &HciEvent) -> Option<Self> {
        if event.event_code != EVT_NUM_COMPLETED_PACKETS {
            return None;
        }
        let mut cursor = Cursor::new(&event.parameters[..]);
        let num_handles = cursor.read_u8().ok()?;
        let mut entries = Vec::with_capacity(num_handles as usize);
        for _ in 0..num_handles {
            let handle = cursor.read_u16::<LittleEndian>().ok()? & HCI_HANDLE_MASK;
            let count = cursor.read_u16::<LittleEndian>().ok()?;
            entries.push((handle, count));
        }
        Some(Self { entries })
    }
}

/// LE Advertising Set Terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvSetTerminated {
    pub status: u8,
    pub adv_handle: u8,
    pub conn_handle: u16,
    pub num_completed_events: u8,
}

impl AdvSetTerminated {
    pub fn parse(event: &HciEvent) -> Option<Self> {
        let mut cursor = le_params(event, EVT_LE_ADV_SET_TERMINATED)?;
        Some(Self {
            status: cursor.read_u8().ok()?,
            adv_handle: cursor.read_u8().ok()?,
            conn_handle: cursor.read_u16::<LittleEndian>().ok()? & HCI_HANDLE_MASK,
            num_completed_events: cursor.read_u8().ok()?,
        })
    }
}

/// LE Periodic Advertising Sync Established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerAdvSyncEstablished {
    pub status: u8,
    pub sync_handle: u16,
    pub sid: u8,
    pub advertiser: LeAddr,
    pub phy: u8,
    pub interval: u16,
    pub clock_accuracy: u8,
}

impl PerAdvSyncEstablished {
    pub fn parse(event: &HciEvent) -> Option<Self> {
        let mut cursor = le_params(event, EVT_LE_PER_ADV_SYNC_ESTABLISHED)?;
        let status = cursor.read_u8().ok()?;
        let sync_handle = cursor.read_u16::<LittleEndian>().ok()? & HCI_HANDLE_MASK;
        let sid = cursor.read_u8().ok()?;
        let addr_type = AddressType::from(cursor.read_u8().ok()?);
        let advertiser = LeAddr::new(addr_type, read_addr(&mut cursor)?);
        Some(Self {
            status,
            sync_handle,
            sid,
            advertiser,
            phy: cursor.read_u8().ok()?,
            interval: cursor.read_u16::<LittleEndian>().ok()?,
            clock_accuracy: cursor.read_u8().ok()?,
        })
    }
}

/// LE Periodic Advertising Report (one fragment)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerAdvReport {
    pub sync_handle: u16,
    pub tx_power: i8,
    pub rssi: i8,
    pub cte_type: u8,
    pub data_status: u8,
    pub data: Vec<u8>,
}

impl PerAdvReport {
    pub fn parse(event: &HciEvent) -> Option<Self> {
        let mut cursor = le_params(event, EVT_LE_PER_ADVERTISING_REPORT)?;
        let sync_handle = cursor.read_u16::<LittleEndian>().ok()? & HCI_HANDLE_MASK;
        let tx_power = cursor.read_i8().ok()?;
        let rssi = cursor.read_i8().ok()?;
        let cte_type = cursor.read_u8().ok()?;
        let data_status = cursor.read_u8().ok()?;
        let data_len = cursor.read_u8().ok()?;
        let mut data = vec![0u8; data_len as usize];
        cursor.read_exact(&mut data).ok()?;
        Some(Self {
            sync_handle,
            tx_power,
            rssi,
            cte_type,
            data_status,
            data,
        })
    }
}

/// LE Periodic Advertising Sync Lost
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerAdvSyncLost {
    pub sync_handle: u16,
}

impl PerAdvSyncLost {
    pub fn parse(event: &HciEvent) -> Option<Self> {
        let mut cursor = le_params(event, EVT_LE_PER_ADV_SYNC_LOST)?;
        Some(Self {
            sync_handle: cursor.read_u16::<LittleEndian>().ok()? & HCI_HANDLE_MASK,
        })
    }
}

/// Encryption Change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionChange {
    pub status: u8,
    pub connection_handle: u16,
    pub enabled: bool,
}

impl EncryptionChange {
    pub fn parse(event: &HciEvent) -> Option<Self> {
        if event.event_code != EVT_ENCRYPTION_CHANGE {
            return None;
        }
        let mut cursor = Cursor::new(&event.parameters[..]);
        Some(Self {
            status: cursor.read_u8().ok()?,
            connection_handle: cursor.read_u16::<LittleEndian>().ok()? & HCI_HANDLE_MASK,
            enabled: cursor.read_u8().ok()? != 0,
        })
    }
}

/// LE Long Term Key Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LtkRequest {
    pub connection_handle: u16,
    pub rand: u64,
    pub ediv: u16,
}

impl LtkRequest {
    pub fn parse(event: &HciEvent) -> Option<Self> {
        let mut cursor = le_params(event, EVT_LE_LTK_REQUEST)?;
        Some(Self {
            connection_handle: cursor.read_u16::<LittleEndian>().ok()? & HCI_HANDLE_MASK,
            rand: cursor.read_u64::<LittleEndian>().ok()?,
            ediv: cursor.read_u16::<LittleEndian>().ok()?,
        })
    }
}
