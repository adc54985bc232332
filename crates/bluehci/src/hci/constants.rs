//! HCI protocol constants
//!
//! This module contains constants used in the Bluetooth HCI protocol.

// HCI packet types
pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_ACL_PKT: u8 = 0x02;
pub const HCI_SCO_PKT: u8 = 0x03;
pub const HCI_EVENT_PKT: u8 = 0x04;
pub const HCI_ISO_PKT: u8 = 0x05;

// Header sizes, excluding the packet type indicator
pub const HCI_COMMAND_HDR_SIZE: usize = 3;
pub const HCI_EVENT_HDR_SIZE: usize = 2;
pub const HCI_ACL_HDR_SIZE: usize = 4;
pub const HCI_SCO_HDR_SIZE: usize = 3;
pub const HCI_ISO_HDR_SIZE: usize = 4;

// Maximum size of HCI command parameters
pub const HCI_MAX_PARAM_LEN: usize = 255;

// OGF (Opcode Group Field) values
pub const OGF_LINK_CTL: u8 = 0x01;
pub const OGF_LINK_POLICY: u8 = 0x02;
pub const OGF_HOST_CTL: u8 = 0x03;
pub const OGF_INFO_PARAM: u8 = 0x04;
pub const OGF_STATUS_PARAM: u8 = 0x05;
pub const OGF_LE: u8 = 0x08;
pub const OGF_VS: u8 = 0x3F;

// Link Control Commands (OGF: 0x01)
pub const OCF_DISCONNECT: u16 = 0x0006;

// Host Controller Commands (OGF: 0x03)
pub const OCF_SET_EVENT_MASK: u16 = 0x0001;
pub const OCF_RESET: u16 = 0x0003;
pub const OCF_WRITE_LE_HOST_SUPPORT: u16 = 0x006D;

// Informational Parameters (OGF: 0x04)
pub const OCF_READ_LOCAL_VERSION_INFO: u16 = 0x0001;
pub const OCF_READ_SUPPORTED_COMMANDS: u16 = 0x0002;
pub const OCF_READ_LOCAL_FEATURES: u16 = 0x0003;
pub const OCF_READ_BUFFER_SIZE: u16 = 0x0005;
pub const OCF_READ_BD_ADDR: u16 = 0x0009;

// LE Command OCF values (OGF: 0x08)
pub const OCF_LE_SET_EVENT_MASK: u16 = 0x0001;
pub const OCF_LE_READ_BUFFER_SIZE: u16 = 0x0002;
pub const OCF_LE_READ_LOCAL_SUPPORTED_FEATURES: u16 = 0x0003;
pub const OCF_LE_SET_RANDOM_ADDRESS: u16 = 0x0005;
pub const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
pub const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;
pub const OCF_LE_ENCRYPT: u16 = 0x0017;
pub const OCF_LE_SET_ADV_SET_RANDOM_ADDRESS: u16 = 0x0035;
pub const OCF_LE_SET_EXT_ADV_PARAMETERS: u16 = 0x0036;
pub const OCF_LE_SET_EXT_ADV_DATA: u16 = 0x0037;
pub const OCF_LE_SET_EXT_SCAN_RESPONSE_DATA: u16 = 0x0038;
pub const OCF_LE_SET_EXT_ADV_ENABLE: u16 = 0x0039;
pub const OCF_LE_REMOVE_ADV_SET: u16 = 0x003C;
pub const OCF_LE_SET_EXT_SCAN_PARAMETERS: u16 = 0x0041;
pub const OCF_LE_SET_EXT_SCAN_ENABLE: u16 = 0x0042;
pub const OCF_LE_PER_ADV_CREATE_SYNC: u16 = 0x0044;
pub const OCF_LE_PER_ADV_CREATE_SYNC_CANCEL: u16 = 0x0045;
pub const OCF_LE_PER_ADV_TERMINATE_SYNC: u16 = 0x0046;
pub const OCF_LE_SET_PER_ADV_RECV_ENABLE: u16 = 0x0059;
pub const OCF_LE_READ_BUFFER_SIZE_V2: u16 = 0x0060;

// Vendor specific commands (OGF: 0x3F)
pub const OCF_VS_READ_VERSION_INFO: u16 = 0x0001;
pub const OCF_VS_READ_SUPPORTED_COMMANDS: u16 = 0x0002;
pub const OCF_VS_READ_SUPPORTED_FEATURES: u16 = 0x0003;

/// Build an opcode from its group and command fields
pub const fn opcode(ogf: u8, ocf: u16) -> u16 {
    ((ogf as u16) << 10) | (ocf & 0x3ff)
}

pub const OP_RESET: u16 = opcode(OGF_HOST_CTL, OCF_RESET);
pub const OP_SET_EVENT_MASK: u16 = opcode(OGF_HOST_CTL, OCF_SET_EVENT_MASK);
pub const OP_WRITE_LE_HOST_SUPPORT: u16 = opcode(OGF_HOST_CTL, OCF_WRITE_LE_HOST_SUPPORT);
pub const OP_READ_LOCAL_VERSION_INFO: u16 = opcode(OGF_INFO_PARAM, OCF_READ_LOCAL_VERSION_INFO);
pub const OP_READ_SUPPORTED_COMMANDS: u16 = opcode(OGF_INFO_PARAM, OCF_READ_SUPPORTED_COMMANDS);
pub const OP_READ_LOCAL_FEATURES: u16 = opcode(OGF_INFO_PARAM, OCF_READ_LOCAL_FEATURES);
pub const OP_READ_BUFFER_SIZE: u16 = opcode(OGF_INFO_PARAM, OCF_READ_BUFFER_SIZE);
pub const OP_READ_BD_ADDR: u16 = opcode(OGF_INFO_PARAM, OCF_READ_BD_ADDR);
pub const OP_LE_SET_EVENT_MASK: u16 = opcode(OGF_LE, OCF_LE_SET_EVENT_MASK);
pub const OP_LE_READ_BUFFER_SIZE: u16 = opcode(OGF_LE, OCF_LE_READ_BUFFER_SIZE);
pub const OP_LE_READ_BUFFER_SIZE_V2: u16 = opcode(OGF_LE, OCF_LE_READ_BUFFER_SIZE_V2);
pub const OP_LE_READ_LOCAL_FEATURES: u16 = opcode(OGF_LE, OCF_LE_READ_LOCAL_SUPPORTED_FEATURES);
pub const OP_LE_SET_RANDOM_ADDRESS: u16 = opcode(OGF_LE, OCF_LE_SET_RANDOM_ADDRESS);
pub const OP_LE_SET_EXT_ADV_ENABLE: u16 = opcode(OGF_LE, OCF_LE_SET_EXT_ADV_ENABLE);
pub const OP_LE_PER_ADV_CREATE_SYNC: u16 = opcode(OGF_LE, OCF_LE_PER_ADV_CREATE_SYNC);
pub const OP_VS_READ_VERSION_INFO: u16 = opcode(OGF_VS, OCF_VS_READ_VERSION_INFO);
pub const OP_VS_READ_SUPPORTED_COMMANDS: u16 = opcode(OGF_VS, OCF_VS_READ_SUPPORTED_COMMANDS);
pub const OP_VS_READ_SUPPORTED_FEATURES: u16 = opcode(OGF_VS, OCF_VS_READ_SUPPORTED_FEATURES);

// HCI Events
pub const EVT_DISCONN_COMPLETE: u8 = 0x05;
pub const EVT_ENCRYPTION_CHANGE: u8 = 0x08;
pub const EVT_CMD_COMPLETE: u8 = 0x0E;
pub const EVT_CMD_STATUS: u8 = 0x0F;
pub const EVT_HARDWARE_ERROR: u8 = 0x10;
pub const EVT_NUM_COMPLETED_PACKETS: u8 = 0x13;
pub const EVT_DATA_BUF_OVERFLOW: u8 = 0x1A;
pub const EVT_LE_META_EVENT: u8 = 0x3E;
pub const EVT_VENDOR: u8 = 0xFF;

// LE Meta Events
pub const EVT_LE_CONN_COMPLETE: u8 = 0x01;
pub const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;
pub const EVT_LE_CONN_UPDATE_COMPLETE: u8 = 0x03;
pub const EVT_LE_LTK_REQUEST: u8 = 0x05;
pub const EVT_LE_ENH_CONN_COMPLETE: u8 = 0x0A;
pub const EVT_LE_EXT_ADVERTISING_REPORT: u8 = 0x0D;
pub const EVT_LE_PER_ADV_SYNC_ESTABLISHED: u8 = 0x0E;
pub const EVT_LE_PER_ADVERTISING_REPORT: u8 = 0x0F;
pub const EVT_LE_PER_ADV_SYNC_LOST: u8 = 0x10;
pub const EVT_LE_ADV_SET_TERMINATED: u8 = 0x12;
pub const EVT_LE_SCAN_REQ_RECEIVED: u8 = 0x13;

// Status codes
pub const HCI_SUCCESS: u8 = 0x00;
pub const HCI_ERR_UNKNOWN_CMD: u8 = 0x01;
pub const HCI_ERR_CONN_LIMIT_EXCEEDED: u8 = 0x09;
pub const HCI_ERR_REMOTE_USER_TERM_CONN: u8 = 0x13;
pub const HCI_ERR_LOCALHOST_TERM_CONN: u8 = 0x16;
pub const HCI_ERR_OP_CANCELLED_BY_HOST: u8 = 0x44;
pub const HCI_ERR_ADV_TIMEOUT: u8 = 0x3C;

// Periodic advertising report data status
pub const DATA_STATUS_COMPLETE: u8 = 0x00;
pub const DATA_STATUS_PARTIAL: u8 = 0x01;
pub const DATA_STATUS_INCOMPLETE: u8 = 0x02;

// Periodic advertising create sync options
pub const PER_ADV_SYNC_OPT_USE_LIST: u8 = 0x01;
pub const PER_ADV_SYNC_OPT_REPORTS_DISABLED: u8 = 0x02;

// Extended advertising properties
pub const EXT_ADV_PROP_CONNECTABLE: u16 = 1 << 0;
pub const EXT_ADV_PROP_SCANNABLE: u16 = 1 << 1;
pub const EXT_ADV_PROP_LEGACY: u16 = 1 << 4;

// Extended advertising report event type
pub const EXT_ADV_EVT_LEGACY: u16 = 1 << 4;
pub const EXT_ADV_EVT_DATA_STATUS_SHIFT: u16 = 5;
/// Reported type for advertising that uses extended PDUs
pub const ADV_TYPE_EXT_ADV: u8 = 0x05;

/// Scanning PHYs bit for LE 1M
pub const LE_SCAN_PHY_1M: u8 = 0x01;

// Extended advertising data operations
pub const EXT_ADV_DATA_OP_COMPLETE: u8 = 0x03;
pub const EXT_ADV_DATA_FRAG_NONE: u8 = 0x01;

// Event mask bits (page 0)
pub const EVT_MASK_DISCONN_COMPLETE: u64 = 1 << 4;
pub const EVT_MASK_ENCRYPT_CHANGE: u64 = 1 << 7;
pub const EVT_MASK_HARDWARE_ERROR: u64 = 1 << 15;
pub const EVT_MASK_DATA_BUF_OVERFLOW: u64 = 1 << 25;
pub const EVT_MASK_LE_META_EVENT: u64 = 1 << 61;

// LE event mask bits
pub const LE_EVT_MASK_CONN_COMPLETE: u64 = 1 << 0;
pub const LE_EVT_MASK_ADVERTISING_REPORT: u64 = 1 << 1;
pub const LE_EVT_MASK_LTK_REQUEST: u64 = 1 << 4;
pub const LE_EVT_MASK_ENH_CONN_COMPLETE: u64 = 1 << 9;
pub const LE_EVT_MASK_EXT_ADVERTISING_REPORT: u64 = 1 << 12;
pub const LE_EVT_MASK_PER_ADV_SYNC_ESTABLISHED: u64 = 1 << 13;
pub const LE_EVT_MASK_PER_ADVERTISING_REPORT: u64 = 1 << 14;
pub const LE_EVT_MASK_PER_ADV_SYNC_LOST: u64 = 1 << 15;
pub const LE_EVT_MASK_ADV_SET_TERMINATED: u64 = 1 << 17;
pub const LE_EVT_MASK_SCAN_REQ_RECEIVED: u64 = 1 << 18;

// Feature bits: (page 0 octet, mask)
pub const FEAT_BREDR_NOT_SUPPORTED: (usize, u8) = (4, 0x20);
pub const FEAT_LE_SUPPORTED: (usize, u8) = (4, 0x40);

// LE feature bits: (octet, mask)
pub const LE_FEAT_EXT_ADV: (usize, u8) = (1, 0x10);
pub const LE_FEAT_PER_ADV: (usize, u8) = (1, 0x20);
pub const LE_FEAT_ISO_CHANNELS: (usize, u8) = (3, 0x40);

// Supported command bits: (octet, mask)
pub const CMD_LE_READ_BUFFER_SIZE_V2: (usize, u8) = (41, 0x20);
pub const CMD_LE_ENCRYPT: (usize, u8) = (27, 0x40);

// Connection handle mask and packet boundary flags
pub const HCI_HANDLE_MASK: u16 = 0x0FFF;
pub const ACL_PB_FIRST_NON_FLUSH: u16 = 0x00;
pub const ACL_PB_FIRST_FLUSH: u16 = 0x02;
pub const ISO_LEN_MASK: u16 = 0x3FFF;
