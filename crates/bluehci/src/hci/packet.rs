//! HCI packet structures and parsing
//!
//! This module contains structures and methods for handling HCI packets:
//! the typed commands the host issues, and the events and data packets the
//! controller sends back.

use crate::error::HciError;
use crate::hci::constants::*;
use byteorder::{ByteOrder, LittleEndian};
use std::io::Cursor;

/// Parameters of LE Set Extended Advertising Parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtAdvParameters {
    pub handle: u8,
    pub properties: u16,
    /// Primary advertising interval bounds, 0.625 ms units (24 bit)
    pub interval_min: u32,
    pub interval_max: u32,
    pub channel_map: u8,
    pub own_addr_type: u8,
    pub peer_addr_type: u8,
    pub peer_addr: [u8; 6],
    pub filter_policy: u8,
    pub tx_power: i8,
    pub primary_phy: u8,
    pub secondary_max_skip: u8,
    pub secondary_phy: u8,
    pub sid: u8,
    pub scan_req_notify: bool,
}

/// One entry of LE Set Extended Advertising Enable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtAdvEnableSet {
    pub handle: u8,
    /// Duration in 10 ms units, 0 for no limit
    pub duration: u16,
    /// Maximum number of extended advertising events, 0 for no limit
    pub max_events: u8,
}

/// HCI commands issued by the host
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HciCommand {
    // Link Control Commands (OGF: 0x01)
    Disconnect { handle: u16, reason: u8 },

    // Host Controller Commands (OGF: 0x03)
    Reset,
    SetEventMask { event_mask: u64 },
    WriteLeHostSupport { le: bool, simultaneous: bool },

    // Informational Parameters (OGF: 0x04)
    ReadLocalVersionInfo,
    ReadSupportedCommands,
    ReadLocalFeatures,
    ReadBufferSize,
    ReadBdAddr,

    // LE Commands (OGF: 0x08)
    LeSetEventMask { event_mask: u64 },
    LeReadBufferSize,
    LeReadBufferSizeV2,
    LeReadLocalFeatures,
    LeSetRandomAddress { address: [u8; 6] },
    LeSetScanParameters {
        scan_type: u8,
        scan_interval: u16,
        scan_window: u16,
        own_address_type: u8,
        filter_policy: u8,
    },
    LeSetScanEnable { enable: bool, filter_duplicates: bool },
    /// Scan parameters for the LE 1M PHY only
    LeSetExtScanParameters {
        own_address_type: u8,
        filter_policy: u8,
        scan_type: u8,
        scan_interval: u16,
        scan_window: u16,
    },
    LeSetExtScanEnable {
        enable: bool,
        filter_duplicates: bool,
        duration: u16,
        period: u16,
    },
    LeEncrypt { key: [u8; 16], plaintext: [u8; 16] },
    LeSetAdvSetRandomAddress { handle: u8, address: [u8; 6] },
    LeSetExtAdvParameters(ExtAdvParameters),
    LeSetExtAdvData { handle: u8, data: Vec<u8> },
    LeSetExtScanResponseData { handle: u8, data: Vec<u8> },
    LeSetExtAdvEnable { enable: bool, sets: Vec<ExtAdvEnableSet> },
    LeRemoveAdvSet { handle: u8 },
    LePeriodicAdvCreateSync {
        options: u8,
        sid: u8,
        addr_type: u8,
        address: [u8; 6],
        skip: u16,
        sync_timeout: u16,
        cte_type: u8,
    },
    LePeriodicAdvCreateSyncCancel,
    LePeriodicAdvTerminateSync { handle: u16 },
    LeSetPeriodicAdvReceiveEnable { handle: u16, enable: bool },

    // Vendor specific commands (OGF: 0x3F)
    VsReadVersionInfo,
    VsReadSupportedCommands,
    VsReadSupportedFeatures,

    /// Any other command, used by chipset drivers
    Raw { opcode: u16, parameters: Vec<u8> },
}

impl HciCommand {
    /// Build a raw command from its group and command fields
    pub fn new(ogf: u8, ocf: u16, parameters: Vec<u8>) -> Self {
        Self::Raw {
            opcode: opcode(ogf, ocf),
            parameters,
        }
    }

    /// Get the OGF and OCF for this command
    pub fn opcode_parts(&self) -> (u8, u16) {
        match self {
            // Link Control Commands
            Self::Disconnect { .. } => (OGF_LINK_CTL, OCF_DISCONNECT),

            // Host Controller Commands
            Self::Reset => (OGF_HOST_CTL, OCF_RESET),
            Self::SetEventMask { .. } => (OGF_HOST_CTL, OCF_SET_EVENT_MASK),
            Self::WriteLeHostSupport { .. } => (OGF_HOST_CTL, OCF_WRITE_LE_HOST_SUPPORT),

            // Informational Parameters
            Self::ReadLocalVersionInfo => (OGF_INFO_PARAM, OCF_READ_LOCAL_VERSION_INFO),
            Self::ReadSupportedCommands => (OGF_INFO_PARAM, OCF_READ_SUPPORTED_COMMANDS),
            Self::ReadLocalFeatures => (OGF_INFO_PARAM, OCF_READ_LOCAL_FEATURES),
            Self::ReadBufferSize => (OGF_INFO_PARAM, OCF_READ_BUFFER_SIZE),
            Self::ReadBdAddr => (OGF_INFO_PARAM, OCF_READ_BD_ADDR),

            // LE Commands
            Self::LeSetEventMask { .. } => (OGF_LE, OCF_LE_SET_EVENT_MASK),
            Self::LeReadBufferSize => (OGF_LE, OCF_LE_READ_BUFFER_SIZE),
            Self::LeReadBufferSizeV2 => (OGF_LE, OCF_LE_READ_BUFFER_SIZE_V2),
            Self::LeReadLocalFeatures => (OGF_LE, OCF_LE_READ_LOCAL_SUPPORTED_FEATURES),
            Self::LeSetRandomAddress { .. } => (OGF_LE, OCF_LE_SET_RANDOM_ADDRESS),
            Self::LeSetScanParameters { .. } => (OGF_LE, OCF_LE_SET_SCAN_PARAMETERS),
            Self::LeSetScanEnable { .. } => (OGF_LE, OCF_LE_SET_SCAN_ENABLE),
            Self::LeSetExtScanParameters { .. } => (OGF_LE, OCF_LE_SET_EXT_SCAN_PARAMETERS),
            Self::LeSetExtScanEnable { .. } => (OGF_LE, OCF_LE_SET_EXT_SCAN_ENABLE),
            Self::LeEncrypt { .. } => (OGF_LE, OCF_LE_ENCRYPT),
            Self::LeSetAdvSetRandomAddress { .. } => (OGF_LE, OCF_LE_SET_ADV_SET_RANDOM_ADDRESS),
            Self::LeSetExtAdvParameters(_) => (OGF_LE, OCF_LE_SET_EXT_ADV_PARAMETERS),
            Self::LeSetExtAdvData { .. } => (OGF_LE, OCF_LE_SET_EXT_ADV_DATA),
            Self::LeSetExtScanResponseData { .. } => (OGF_LE, OCF_LE_SET_EXT_SCAN_RESPONSE_DATA),
            Self::LeSetExtAdvEnable { .. } => (OGF_LE, OCF_LE_SET_EXT_ADV_ENABLE),
            Self::LeRemoveAdvSet { .. } => (OGF_LE, OCF_LE_REMOVE_ADV_SET),
            Self::LePeriodicAdvCreateSync { .. } => (OGF_LE, OCF_LE_PER_ADV_CREATE_SYNC),
            Self::LePeriodicAdvCreateSyncCancel => (OGF_LE, OCF_LE_PER_ADV_CREATE_SYNC_CANCEL),
            Self::LePeriodicAdvTerminateSync { .. } => (OGF_LE, OCF_LE_PER_ADV_TERMINATE_SYNC),
            Self::LeSetPeriodicAdvReceiveEnable { .. } => (OGF_LE, OCF_LE_SET_PER_ADV_RECV_ENABLE),

            // Vendor specific commands
            Self::VsReadVersionInfo => (OGF_VS, OCF_VS_READ_VERSION_INFO),
            Self::VsReadSupportedCommands => (OGF_VS, OCF_VS_READ_SUPPORTED_COMMANDS),
            Self::VsReadSupportedFeatures => (OGF_VS, OCF_VS_READ_SUPPORTED_FEATURES),

            Self::Raw { opcode, .. } => ((opcode >> 10) as u8, opcode & 0x3ff),
        }
    }

    /// The 16-bit opcode of this command
    pub fn opcode(&self) -> u16 {
        let (ogf, ocf) = self.opcode_parts();
        opcode(ogf, ocf)
    }

    /// Convert the command to its raw parameter bytes
    pub fn parameters(&self) -> Vec<u8> {
        match self {
            Self::Reset
            | Self::ReadLocalVersionInfo
            | Self::ReadSupportedCommands
            | Self::ReadLocalFeatures
            | Self::ReadBufferSize
            | Self::ReadBdAddr
            | Self::LeReadBufferSize
            | Self::LeReadBufferSizeV2
            | Self::LeReadLocalFeatures
            | Self::LePeriodicAdvCreateSyncCancel
            | Self::VsReadVersionInfo
            | Self::VsReadSupportedCommands
            | Self::VsReadSupportedFeatures => vec![],

            Self::Disconnect { handle, reason } => {
                let mut params = Vec::with_capacity(3);
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(*reason);
                params
            }

            Self::SetEventMask { event_mask } | Self::LeSetEventMask { event_mask } => {
                event_mask.to_le_bytes().to_vec()
            }

            Self::WriteLeHostSupport { le, simultaneous } => vec![*le as u8, *simultaneous as u8],

            Self::LeSetRandomAddress { address } => address.to_vec(),

            Self::LeSetScanParameters {
                scan_type,
                scan_interval,
                scan_window,
                own_address_type,
                filter_policy,
            } => {
                let mut params = Vec::with_capacity(7);
                params.push(*scan_type);
                params.extend_from_slice(&scan_interval.to_le_bytes());
                params.extend_from_slice(&scan_window.to_le_bytes());
                params.push(*own_address_type);
                params.push(*filter_policy);
                params
            }

            Self::LeSetScanEnable {
                enable,
                filter_duplicates,
            } => vec![*enable as u8, *filter_duplicates as u8],

            Self::LeSetExtScanParameters {
                own_address_type,
                filter_policy,
                scan_type,
                scan_interval,
                scan_window,
            } => {
                let mut params = Vec::with_capacity(8);
                params.push(*own_address_type);
                params.push(*filter_policy);
                params.push(LE_SCAN_PHY_1M);
                params.push(*scan_type);
                params.extend_from_slice(&scan_interval.to_le_bytes());
                params.extend_from_slice(&scan_window.to_le_bytes());
                params
            }

            Self::LeSetExtScanEnable {
                enable,
                filter_duplicates,
                duration,
                period,
            } => {
                let mut params = Vec::with_capacity(6);
                params.push(*enable as u8);
                params.push(*filter_duplicates as u8);
                params.extend_from_slice(&duration.to_le_bytes());
                params.extend_from_slice(&period.to_le_bytes());
                params
            }

            Self::LeEncrypt { key, plaintext } => {
                let mut params = Vec::with_capacity(32);
                params.extend_from_slice(key);
                params.extend_from_slice(plaintext);
                params
            }

            Self::LeSetAdvSetRandomAddress { handle, address } => {
                let mut params = Vec::with_capacity(7);
                params.push(*handle);
                params.extend_from_slice(address);
                params
            }

            Self::LeSetExtAdvParameters(p) => {
                let mut params = vec![0u8; 25];
                params[0] = p.handle;
                LittleEndian::write_u16(&mut params[1..3], p.properties);
                LittleEndian::write_u24(&mut params[3..6], p.interval_min & 0x00FF_FFFF);
                LittleEndian::write_u24(&mut params[6..9], p.interval_max & 0x00FF_FFFF);
                params[9] = p.channel_map;
                params[10] = p.own_addr_type;
                params[11] = p.peer_addr_type;
                params[12..18].copy_from_slice(&p.peer_addr);
                params[18] = p.filter_policy;
                params[19] = p.tx_power as u8;
                params[20] = p.primary_phy;
                params[21] = p.secondary_max_skip;
                params[22] = p.secondary_phy;
                params[23] = p.sid;
                params[24] = p.scan_req_notify as u8;
                params
            }

            Self::LeSetExtAdvData { handle, data } | Self::LeSetExtScanResponseData { handle, data } => {
                let mut params = Vec::with_capacity(4 + data.len());
                params.push(*handle);
                params.push(EXT_ADV_DATA_OP_COMPLETE);
                params.push(EXT_ADV_DATA_FRAG_NONE);
                params.push(data.len() as u8);
                params.extend_from_slice(data);
                params
            }

            Self::LeSetExtAdvEnable { enable, sets } => {
                let mut params = Vec::with_capacity(2 + sets.len() * 4);
                params.push(*enable as u8);
                params.push(sets.len() as u8);
                for set in sets {
                    params.push(set.handle);
                    params.extend_from_slice(&set.duration.to_le_bytes());
                    params.push(set.max_events);
                }
                params
            }

            Self::LeRemoveAdvSet { handle } => vec![*handle],

            Self::LePeriodicAdvCreateSync {
                options,
                sid,
                addr_type,
                address,
                skip,
                sync_timeout,
                cte_type,
            } => {
                let mut params = Vec::with_capacity(14);
                params.push(*options);
                params.push(*sid);
                params.push(*addr_type);
                params.extend_from_slice(address);
                params.extend_from_slice(&skip.to_le_bytes());
                params.extend_from_slice(&sync_timeout.to_le_bytes());
                params.push(*cte_type);
                params
            }

            Self::LePeriodicAdvTerminateSync { handle } => handle.to_le_bytes().to_vec(),

            Self::LeSetPeriodicAdvReceiveEnable { handle, enable } => {
                let mut params = Vec::with_capacity(3);
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(*enable as u8);
                params
            }

            Self::Raw { parameters, .. } => parameters.clone(),
        }
    }

    /// Convert the command to a raw HCI packet
    pub fn to_packet(&self) -> Vec<u8> {
        let params = self.parameters();

        let mut packet = Vec::with_capacity(1 + HCI_COMMAND_HDR_SIZE + params.len());
        packet.push(HCI_COMMAND_PKT);
        packet.extend_from_slice(&self.opcode().to_le_bytes());
        packet.push(params.len() as u8);
        packet.extend_from_slice(&params);
        packet
    }
}

/// HCI Event packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciEvent {
    pub event_code: u8,
    pub parameter_total_length: u8,
    pub parameters: Vec<u8>,
}

impl HciEvent {
    /// Parse an HCI event from raw bytes (without the packet type indicator)
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HCI_EVENT_HDR_SIZE {
            return None;
        }

        let event_code = data[0];
        let parameter_total_length = data[1];

        if data.len() < (parameter_total_length as usize + HCI_EVENT_HDR_SIZE) {
            return None;
        }

        let parameters = data[2..(parameter_total_length as usize + 2)].to_vec();

        Some(HciEvent {
            event_code,
            parameter_total_length,
            parameters,
        })
    }

    /// Build an event from its code and parameters
    pub fn new(event_code: u8, parameters: Vec<u8>) -> Self {
        Self {
            event_code,
            parameter_total_length: parameters.len() as u8,
            parameters,
        }
    }

    pub fn get_event_code(&self) -> u8 {
        self.event_code
    }

    pub fn get_parameters(&self) -> &[u8] {
        &self.parameters
    }

    /// LE subevent code, for LE meta events
    pub fn le_subevent(&self) -> Option<u8> {
        if self.event_code == EVT_LE_META_EVENT {
            self.parameters.first().copied()
        } else {
            None
        }
    }

    /// Check whether this is the Command Complete for the given command
    pub fn is_command_complete(&self, ogf: u8, ocf: u16) -> bool {
        CommandComplete::parse(self).map_or(false, |cc| cc.opcode == opcode(ogf, ocf))
    }

    /// Status of a Command Complete or Command Status event
    pub fn get_status(&self) -> u8 {
        match self.event_code {
            EVT_CMD_COMPLETE => CommandComplete::parse(self).map_or(0xFF, |cc| cc.status()),
            EVT_CMD_STATUS => CommandStatus::parse(self).map_or(0xFF, |cs| cs.status),
            _ => self.parameters.first().copied().unwrap_or(0xFF),
        }
    }

    /// Serialize to a full HCI packet including the type indicator
    pub fn to_packet(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(3 + self.parameters.len());
        packet.push(HCI_EVENT_PKT);
        packet.push(self.event_code);
        packet.push(self.parameters.len() as u8);
        packet.extend_from_slice(&self.parameters);
        packet
    }
}

/// Command Complete event contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandComplete {
    pub num_hci_command_packets: u8,
    pub opcode: u16,
    pub return_parameters: Vec<u8>,
}

impl CommandComplete {
    pub fn parse(event: &HciEvent) -> Option<Self> {
        if event.event_code != EVT_CMD_COMPLETE || event.parameters.len() < 3 {
            return None;
        }

        Some(Self {
            num_hci_command_packets: event.parameters[0],
            opcode: LittleEndian::read_u16(&event.parameters[1..3]),
            return_parameters: event.parameters[3..].to_vec(),
        })
    }

    /// First return parameter, which is the status for every command we issue
    pub fn status(&self) -> u8 {
        self.return_parameters.first().copied().unwrap_or(HCI_SUCCESS)
    }

    /// Return parameters after the status byte
    pub fn payload(&self) -> &[u8] {
        self.return_parameters.get(1..).unwrap_or(&[])
    }
}

/// Command Status event contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatus {
    pub status: u8,
    pub num_hci_command_packets: u8,
    pub opcode: u16,
}

impl CommandStatus {
    pub fn parse(event: &HciEvent) -> Option<Self> {
        if event.event_code != EVT_CMD_STATUS || event.parameters.len() < 4 {
            return None;
        }

        Some(Self {
            status: event.parameters[0],
            num_hci_command_packets: event.parameters[1],
            opcode: LittleEndian::read_u16(&event.parameters[2..4]),
        })
    }
}

/// ACL data packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclPacket {
    pub handle: u16,
    pub packet_boundary: u8,
    pub broadcast: u8,
    pub data: Vec<u8>,
}

impl AclPacket {
    pub fn new(handle: u16, data: Vec<u8>) -> Self {
        Self {
            handle: handle & HCI_HANDLE_MASK,
            packet_boundary: ACL_PB_FIRST_NON_FLUSH as u8,
            broadcast: 0,
            data,
        }
    }

    pub fn to_packet(&self) -> Vec<u8> {
        let handle_flags = (self.handle & HCI_HANDLE_MASK)
            | ((self.packet_boundary as u16 & 0x3) << 12)
            | ((self.broadcast as u16 & 0x3) << 14);

        let mut packet = Vec::with_capacity(1 + HCI_ACL_HDR_SIZE + self.data.len());
        packet.push(HCI_ACL_PKT);
        packet.extend_from_slice(&handle_flags.to_le_bytes());
        packet.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        packet.extend_from_slice(&self.data);
        packet
    }
}

/// ISO data packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoPacket {
    pub handle: u16,
    pub packet_boundary: u8,
    pub timestamp_present: bool,
    pub data: Vec<u8>,
}

impl IsoPacket {
    pub fn new(handle: u16, data: Vec<u8>) -> Self {
        Self {
            handle: handle & HCI_HANDLE_MASK,
            packet_boundary: 0x02,
            timestamp_present: false,
            data,
        }
    }

    pub fn to_packet(&self) -> Vec<u8> {
        let handle_flags = (self.handle & HCI_HANDLE_MASK)
            | ((self.packet_boundary as u16 & 0x3) << 12)
            | ((self.timestamp_present as u16) << 14);

        let mut packet = Vec::with_capacity(1 + HCI_ISO_HDR_SIZE + self.data.len());
        packet.push(HCI_ISO_PKT);
        packet.extend_from_slice(&handle_flags.to_le_bytes());
        packet.extend_from_slice(&((self.data.len() as u16) & ISO_LEN_MASK).to_le_bytes());
        packet.extend_from_slice(&self.data);
        packet
    }
}

/// A complete HCI packet as carried by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciPacket {
    Command { opcode: u16, parameters: Vec<u8> },
    Acl(AclPacket),
    Sco { handle: u16, data: Vec<u8> },
    Event(HciEvent),
    Iso(IsoPacket),
}

impl HciPacket {
    /// Header length (after the type indicator) and declared payload length
    ///
    /// Returns `None` when `header` is too short to hold the header.
    pub fn declared_len(packet_type: u8, header: &[u8]) -> Result<Option<(usize, usize)>, HciError> {
        let hdr_len = match packet_type {
            HCI_COMMAND_PKT => HCI_COMMAND_HDR_SIZE,
            HCI_ACL_PKT => HCI_ACL_HDR_SIZE,
            HCI_SCO_PKT => HCI_SCO_HDR_SIZE,
            HCI_EVENT_PKT => HCI_EVENT_HDR_SIZE,
            HCI_ISO_PKT => HCI_ISO_HDR_SIZE,
            other => return Err(HciError::UnknownPacketType(other)),
        };
        if header.len() < hdr_len {
            return Ok(None);
        }

        let payload_len = match packet_type {
            HCI_COMMAND_PKT => header[2] as usize,
            HCI_ACL_PKT => LittleEndian::read_u16(&header[2..4]) as usize,
            HCI_SCO_PKT => header[2] as usize,
            HCI_EVENT_PKT => header[1] as usize,
            _ => (LittleEndian::read_u16(&header[2..4]) & ISO_LEN_MASK) as usize,
        };
        Ok(Some((hdr_len, payload_len)))
    }

    /// Parse a full frame: `[type][header][payload]`
    ///
    /// The declared payload length must match the bytes available exactly.
    pub fn parse(frame: &[u8]) -> Result<Self, HciError> {
        let (&packet_type, rest) = frame.split_first().ok_or(HciError::InvalidPacketFormat)?;
        let (hdr_len, payload_len) =
            Self::declared_len(packet_type, rest)?.ok_or(HciError::InvalidPacketFormat)?;

        let available = rest.len() - hdr_len;
        if available != payload_len {
            return Err(HciError::LengthMismatch {
                declared: payload_len,
                available,
            });
        }

        let header = &rest[..hdr_len];
        let payload = rest[hdr_len..].to_vec();

        let packet = match packet_type {
            HCI_COMMAND_PKT => HciPacket::Command {
                opcode: LittleEndian::read_u16(&header[0..2]),
                parameters: payload,
            },
            HCI_ACL_PKT => {
                let handle_flags = LittleEndian::read_u16(&header[0..2]);
                HciPacket::Acl(AclPacket {
                    handle: handle_flags & HCI_HANDLE_MASK,
                    packet_boundary: ((handle_flags >> 12) & 0x3) as u8,
                    broadcast: ((handle_flags >> 14) & 0x3) as u8,
                    data: payload,
                })
            }
            HCI_SCO_PKT => HciPacket::Sco {
                handle: LittleEndian::read_u16(&header[0..2]) & HCI_HANDLE_MASK,
                data: payload,
            },
            HCI_EVENT_PKT => HciPacket::Event(HciEvent {
                event_code: header[0],
                parameter_total_length: header[1],
                parameters: payload,
            }),
            _ => {
                let handle_flags = LittleEndian::read_u16(&header[0..2]);
                HciPacket::Iso(IsoPacket {
                    handle: handle_flags & HCI_HANDLE_MASK,
                    packet_boundary: ((handle_flags >> 12) & 0x3) as u8,
                    timestamp_present: handle_flags & (1 << 14) != 0,
                    data: payload,
                })
            }
        };
        Ok(packet)
    }
}

/// LE Advertising Report Event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeAdvertisingReport {
    pub event_type: u8,
    pub address_type: u8,
    pub address: [u8; 6],
    pub data_length: u8,
    pub data: Vec<u8>,
    pub rssi: i8,
}

impl LeAdvertisingReport {
    /// Parse every report carried by an LE Advertising Report meta event
    pub fn parse_from_event(event: &HciEvent) -> Result<Vec<Self>, HciError> {
        if event.le_subevent() != Some(EVT_LE_ADVERTISING_REPORT) {
            return Err(HciError::InvalidPacketFormat);
        }

        let params = &event.parameters;
        let num_reports = *params.get(1).ok_or(HciError::InvalidPacketFormat)? as usize;
        let mut cursor = Cursor::new(&params[2..]);
        let mut reports = Vec::with_capacity(num_reports);

        for _ in 0..num_reports {
            reports.push(Self::parse_one(&mut cursor).ok_or(HciError::InvalidPacketFormat)?);
        }
        Ok(reports)
    }

    fn parse_one(cursor: &mut Cursor<&[u8]>) -> Option<Self> {
        use byteorder::ReadBytesExt;
        use std::io::Read;

        let event_type = cursor.read_u8().ok()?;
        let address_type = cursor.read_u8().ok()?;
        let mut address = [0u8; 6];
        cursor.read_exact(&mut address).ok()?;
        let data_length = cursor.read_u8().ok()?;
        let mut data = vec![0u8; data_length as usize];
        cursor.read_exact(&mut data).ok()?;
        let rssi = cursor.read_i8().ok()?;

        Some(LeAdvertisingReport {
            event_type,
            address_type,
            address,
            data_length,
            data,
            rssi,
        })
    }
}

/// One report of an LE Extended Advertising Report event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeExtAdvertisingReport {
    pub event_type: u16,
    pub address_type: u8,
    pub address: [u8; 6],
    pub primary_phy: u8,
    pub secondary_phy: u8,
    pub sid: u8,
    pub tx_power: i8,
    pub rssi: i8,
    pub periodic_interval: u16,
    pub direct_address_type: u8,
    pub direct_address: [u8; 6],
    pub data: Vec<u8>,
}

impl LeExtAdvertisingReport {
    /// Parse every report carried by an LE Extended Advertising Report meta event
    pub fn parse_from_event(event: &HciEvent) -> Result<Vec<Self>, HciError> {
        if event.le_subevent() != Some(EVT_LE_EXT_ADVERTISING_REPORT) {
            return Err(HciError::InvalidPacketFormat);
        }

        let params = &event.parameters;
        let num_reports = *params.get(1).ok_or(HciError::InvalidPacketFormat)? as usize;
        let mut cursor = Cursor::new(&params[2..]);
        let mut reports = Vec::with_capacity(num_reports);

        for _ in 0..num_reports {
            reports.push(Self::parse_one(&mut cursor).ok_or(HciError::InvalidPacketFormat)?);
        }
        Ok(reports)
    }

    fn parse_one(cursor: &mut Cursor<&[u8]>) -> Option<Self> {
        use byteorder::ReadBytesExt;
        use std::io::Read;

        let event_type = cursor.read_u16::<LittleEndian>().ok()?;
        let address_type = cursor.read_u8().ok()?;
        let mut address = [0u8; 6];
        cursor.read_exact(&mut address).ok()?;
        let primary_phy = cursor.read_u8().ok()?;
        let secondary_phy = cursor.read_u8().ok()?;
        let sid = cursor.read_u8().ok()?;
        let tx_power = cursor.read_i8().ok()?;
        let rssi = cursor.read_i8().ok()?;
        let periodic_interval = cursor.read_u16::<LittleEndian>().ok()?;
        let direct_address_type = cursor.read_u8().ok()?;
        let mut direct_address = [0u8; 6];
        cursor.read_exact(&mut direct_address).ok()?;
        let data_length = cursor.read_u8().ok()?;
        let mut data = vec![0u8; data_length as usize];
        cursor.read_exact(&mut data).ok()?;

        Some(LeExtAdvertisingReport {
            event_type,
            address_type,
            address,
            primary_phy,
            secondary_phy,
            sid,
            tx_power,
            rssi,
            periodic_interval,
            direct_address_type,
            direct_address,
            data,
        })
    }

    /// Complete, partial (more to come) or incomplete (truncated)
    pub fn data_status(&self) -> u8 {
        ((self.event_type >> EXT_ADV_EVT_DATA_STATUS_SHIFT) & 0x03) as u8
    }

    /// The legacy advertising type, or [`ADV_TYPE_EXT_ADV`] for extended PDUs
    pub fn adv_type(&self) -> u8 {
        if self.event_type & EXT_ADV_EVT_LEGACY == 0 {
            return ADV_TYPE_EXT_ADV;
        }
        match self.event_type & 0x1F {
            0x13 => 0x00, // ADV_IND
            0x15 => 0x01, // ADV_DIRECT_IND
            0x12 => 0x02, // ADV_SCAN_IND
            0x10 => 0x03, // ADV_NONCONN_IND
            _ => 0x04,    // SCAN_RSP
        }
    }
}
