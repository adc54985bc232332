//! Unit tests for HCI packet parsing and serialization

use super::constants::*;
use super::events::*;
use super::packet::*;
use crate::error::HciError;
use crate::gap::{AddressType, BdAddr, Role};

#[test]
fn test_hci_command_serialization() {
    // Test Reset command
    let command = HciCommand::Reset;
    let packet = command.to_packet();

    assert_eq!(packet[0], HCI_COMMAND_PKT);

    // Opcode: Reset (0x0003)
    let opcode = u16::from_le_bytes([packet[1], packet[2]]);
    assert_eq!(opcode, 0x0C03); // OGF_HOST_CTL << 10 | OCF_RESET
    assert_eq!(opcode, OP_RESET);

    // Param length: 0
    assert_eq!(packet[3], 0);

    // Test LE Set Scan Parameters command
    let command = HciCommand::LeSetScanParameters {
        scan_type: 0x01,
        scan_interval: 0x0010,
        scan_window: 0x0010,
        own_address_type: 0x00,
        filter_policy: 0x00,
    };

    let packet = command.to_packet();

    // Opcode: LE Set Scan Parameters (0x000B)
    let opcode = u16::from_le_bytes([packet[1], packet[2]]);
    assert_eq!(opcode, 0x200B);
    assert_eq!(packet[3], 7);
    assert_eq!(packet[4], 0x01); // scan_type
    assert_eq!(u16::from_le_bytes([packet[5], packet[6]]), 0x0010); // scan_interval
    assert_eq!(u16::from_le_bytes([packet[7], packet[8]]), 0x0010); // scan_window

    // Test Disconnect command
    let command = HciCommand::Disconnect {
        handle: 0x0040,
        reason: 0x13,
    };

    let packet = command.to_packet();
    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0x0406);
    assert_eq!(packet[3], 3);
    assert_eq!(u16::from_le_bytes([packet[4], packet[5]]), 0x0040); // handle
    assert_eq!(packet[6], 0x13); // reason

    // Test Raw command
    let command = HciCommand::new(OGF_VS, 0x0010, vec![0x01, 0x02, 0x03]);
    let packet = command.to_packet();
    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0xFC10);
    assert_eq!(command.opcode_parts(), (OGF_VS, 0x0010));
    assert_eq!(&packet[3..], &[3, 0x01, 0x02, 0x03]);
}

#[test]
fn test_ext_adv_command_serialization() {
    let params = ExtAdvParameters {
        handle: 2,
        properties: EXT_ADV_PROP_CONNECTABLE | EXT_ADV_PROP_SCANNABLE | EXT_ADV_PROP_LEGACY,
        interval_min: 0x0000A0,
        interval_max: 0x0000F0,
        channel_map: 0x07,
        own_addr_type: 0x01,
        peer_addr_type: 0x00,
        peer_addr: [0; 6],
        filter_policy: 0x00,
        tx_power: -4,
        primary_phy: 0x01,
        secondary_max_skip: 0,
        secondary_phy: 0x01,
        sid: 5,
        scan_req_notify: false,
    };

    let packet = HciCommand::LeSetExtAdvParameters(params).to_packet();
    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0x2036);
    assert_eq!(packet[3], 25);
    let p = &packet[4..];
    assert_eq!(p[0], 2);
    assert_eq!(u16::from_le_bytes([p[1], p[2]]), 0x0013);
    assert_eq!(&p[3..6], &[0xA0, 0x00, 0x00]);
    assert_eq!(&p[6..9], &[0xF0, 0x00, 0x00]);
    assert_eq!(p[19], 0xFC); // -4 dBm
    assert_eq!(p[23], 5);

    let packet = HciCommand::LeSetExtAdvEnable {
        enable: true,
        sets: vec![ExtAdvEnableSet {
            handle: 2,
            duration: 500,
            max_events: 3,
        }],
    }
    .to_packet();
    assert_eq!(&packet[3..], &[6, 1, 1, 2, 0xF4, 0x01, 3]);

    let packet = HciCommand::LeSetExtAdvData {
        handle: 2,
        data: vec![0x02, 0x01, 0x06],
    }
    .to_packet();
    assert_eq!(&packet[3..], &[7, 2, 0x03, 0x01, 3, 0x02, 0x01, 0x06]);
}

#[test]
fn test_periodic_sync_command_serialization() {
    let packet = HciCommand::LePeriodicAdvCreateSync {
        options: PER_ADV_SYNC_OPT_USE_LIST,
        sid: 3,
        addr_type: 1,
        address: [1, 2, 3, 4, 5, 0xC6],
        skip: 0,
        sync_timeout: 0x0100,
        cte_type: 0,
    }
    .to_packet();

    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), OP_LE_PER_ADV_CREATE_SYNC);
    assert_eq!(packet[3], 14);
    assert_eq!(
        &packet[4..],
        &[1, 3, 1, 1, 2, 3, 4, 5, 0xC6, 0, 0, 0x00, 0x01, 0]
    );

    let packet = HciCommand::LeSetPeriodicAdvReceiveEnable {
        handle: 0x0101,
        enable: false,
    }
    .to_packet();
    assert_eq!(&packet[3..], &[3, 0x01, 0x01, 0]);
}

#[test]
fn test_hci_event_parsing() {
    // Create a simple Command Complete event
    let data = [
        EVT_CMD_COMPLETE, // Event code
        4,                // Parameter length
        1,                // Num_HCI_Command_Packets
        0x03,             // Command_Opcode (low byte)
        0x0C,             // Command_Opcode (high byte)
        0x00,             // Status
    ];

    let event = HciEvent::parse(&data).unwrap();

    assert_eq!(event.event_code, EVT_CMD_COMPLETE);
    assert_eq!(event.parameter_total_length, 4);
    assert_eq!(event.parameters, vec![1, 0x03, 0x0C, 0x00]);

    // Test is_command_complete method
    assert!(event.is_command_complete(OGF_HOST_CTL, OCF_RESET));
    assert!(!event.is_command_complete(OGF_LINK_CTL, OCF_DISCONNECT));

    // Test get_status method
    assert_eq!(event.get_status(), 0x00);

    let cc = CommandComplete::parse(&event).unwrap();
    assert_eq!(cc.opcode, OP_RESET);
    assert_eq!(cc.status(), HCI_SUCCESS);
    assert!(cc.payload().is_empty());

    let event = HciEvent::parse(&[EVT_CMD_STATUS, 4, 0x0C, 1, 0x44, 0x20]).unwrap();
    let cs = CommandStatus::parse(&event).unwrap();
    assert_eq!(cs.status, 0x0C);
    assert_eq!(cs.opcode, OP_LE_PER_ADV_CREATE_SYNC);
    assert_eq!(event.get_status(), 0x0C);

    // Invalid data tests
    assert!(HciEvent::parse(&[]).is_none()); // Empty data
    assert!(HciEvent::parse(&[EVT_CMD_COMPLETE, 10, 1, 2]).is_none()); // Too short for parameter length
}

#[test]
fn test_full_frame_parsing() {
    let acl = HciPacket::parse(&[HCI_ACL_PKT, 0x40, 0x20, 0x02, 0x00, 0xAA, 0xBB]).unwrap();
    match acl {
        HciPacket::Acl(acl) => {
            assert_eq!(acl.handle, 0x0040);
            assert_eq!(acl.packet_boundary, 0x02);
            assert_eq!(acl.data, vec![0xAA, 0xBB]);
        }
        other => panic!("unexpected packet {:?}", other),
    }

    let iso = IsoPacket::new(0x0100, vec![1, 2, 3]).to_packet();
    assert!(matches!(HciPacket::parse(&iso).unwrap(), HciPacket::Iso(p) if p.handle == 0x0100));

    assert!(matches!(
        HciPacket::parse(&[0x09, 0x00]),
        Err(HciError::UnknownPacketType(0x09))
    ));
    assert!(matches!(
        HciPacket::parse(&[HCI_ACL_PKT, 0x40, 0x00, 0x05, 0x00, 0xAA]),
        Err(HciError::LengthMismatch {
            declared: 5,
            available: 1
        })
    ));
    assert!(matches!(
        HciPacket::parse(&[HCI_EVENT_PKT, 0x0E]),
        Err(HciError::InvalidPacketFormat)
    ));
}

#[test]
fn test_le_advertising_report_parsing() {
    let event = HciEvent {
        event_code: EVT_LE_META_EVENT,
        parameter_total_length: 15,
        parameters: vec![
            EVT_LE_ADVERTISING_REPORT, // Subevent code
            1,                         // Num_Reports
            0,                         // Event_Type
            0,                         // Address_Type
            0x01,
            0x02,
            0x03,
            0x04,
            0x05,
            0x06, // Address
            3,    // Data_Length
            0x09,
            0x54,
            0x65, // Data
            0xC3, // RSSI
        ],
    };

    // Parse LE Advertising Report
    let reports = LeAdvertisingReport::parse_from_event(&event).unwrap();

    assert_eq!(reports.len(), 1);

    let report = &reports[0];
    assert_eq!(report.event_type, 0);
    assert_eq!(report.address_type, 0);
    assert_eq!(report.address, [0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
    assert_eq!(report.data_length, 3);
    assert_eq!(report.data, vec![0x09, 0x54, 0x65]);
    assert_eq!(report.rssi, -61);

    // Not an LE Meta event
    let invalid_event = HciEvent::new(EVT_CMD_COMPLETE, vec![1, 0x03, 0x0C, 0x00]);
    assert!(LeAdvertisingReport::parse_from_event(&invalid_event).is_err());

    // Not an Advertising Report subevent
    let invalid_event = HciEvent::new(EVT_LE_META_EVENT, vec![EVT_LE_CONN_COMPLETE, 0x00, 0x00]);
    assert!(LeAdvertisingReport::parse_from_event(&invalid_event).is_err());

    // No reports
    let empty = HciEvent::new(EVT_LE_META_EVENT, vec![EVT_LE_ADVERTISING_REPORT, 0]);
    assert_eq!(LeAdvertisingReport::parse_from_event(&empty).unwrap().len(), 0);

    // Truncated report
    let truncated = HciEvent::new(EVT_LE_META_EVENT, vec![EVT_LE_ADVERTISING_REPORT, 1, 0, 0]);
    assert!(LeAdvertisingReport::parse_from_event(&truncated).is_err());
}

#[test]
fn test_connection_event_parsing() {
    // Create an LE Connection Complete event
    let data = [
        EVT_LE_META_EVENT,    // Event code
        19,                   // Parameter length
        EVT_LE_CONN_COMPLETE, // Subevent code
        0x00,                 // Status
        0x40,
        0x00, // Connection_Handle
        0x01, // Role
        0x00, // Peer_Address_Type
        0x01,
        0x02,
        0x03,
        0x04,
        0x05,
        0x06, // Peer_Address
        0x0A,
        0x00, // Conn_Interval
        0x00,
        0x00, // Conn_Latency
        0x80,
        0x0C, // Supervision_Timeout
        0x00, // Central_Clock_Accuracy
    ];

    let event = HciEvent::parse(&data).unwrap();
    let conn_complete = LeConnectionComplete::parse(&event).unwrap();

    assert_eq!(conn_complete.status, 0x00);
    assert_eq!(conn_complete.connection_handle, 0x0040);
    assert_eq!(conn_complete.role, Role::Peripheral);
    assert_eq!(conn_complete.peer.kind, AddressType::Public);
    assert_eq!(
        conn_complete.peer.addr,
        BdAddr::new([0x01, 0x02, 0x03, 0x04, 0x05, 0x06])
    );
    assert_eq!(conn_complete.local_rpa, None);
    assert_eq!(conn_complete.conn_interval, 0x000A);
    assert_eq!(conn_complete.supervision_timeout, 0x0C80);

    // Create a Disconnection Complete event
    let data = [
        EVT_DISCONN_COMPLETE, // Event code
        4,                    // Parameter length
        0x00,                 // Status
        0x40,
        0x00, // Connection_Handle
        0x13, // Reason
    ];

    let event = HciEvent::parse(&data).unwrap();
    let disc_complete = DisconnectionComplete::parse(&event).unwrap();

    assert_eq!(disc_complete.status, 0x00);
    assert_eq!(disc_complete.connection_handle, 0x0040);
    assert_eq!(disc_complete.reason, 0x13);

    // Not an LE Meta event for connection complete
    let invalid_event = HciEvent::new(EVT_CMD_COMPLETE, vec![1, 0x03, 0x0C, 0x00]);
    assert!(LeConnectionComplete::parse(&invalid_event).is_none());
    assert!(DisconnectionComplete::parse(&invalid_event).is_none());
}

#[test]
fn test_enhanced_connection_complete_parsing() {
    let mut params = vec![EVT_LE_ENH_CONN_COMPLETE, 0x00, 0x41, 0x00, 0x00, 0x01];
    params.extend_from_slice(&[6, 5, 4, 3, 2, 0xC1]); // Peer_Address
    params.extend_from_slice(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]); // Local RPA
    params.extend_from_slice(&[0; 6]); // Peer RPA
    params.extend_from_slice(&[0x18, 0x00, 0x00, 0x00, 0x48, 0x00, 0x01]);

    let event = HciEvent::new(EVT_LE_META_EVENT, params);
    let cc = LeConnectionComplete::parse(&event).unwrap();
    assert_eq!(cc.connection_handle, 0x0041);
    assert_eq!(cc.role, Role::Central);
    assert_eq!(cc.peer.kind, AddressType::Random);
    assert!(cc.peer.addr.is_static_random());
    assert_eq!(
        cc.local_rpa,
        Some(BdAddr::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]))
    );
    assert_eq!(cc.conn_interval, 0x0018);
    assert_eq!(cc.central_clock_accuracy, 0x01);
}

#[test]
fn test_periodic_event_parsing() {
    let mut params = vec![EVT_LE_PER_ADV_SYNC_ESTABLISHED, 0x00, 0x01, 0x00, 0x03, 0x01];
    params.extend_from_slice(&[1, 2, 3, 4, 5, 0xC6]);
    params.extend_from_slice(&[0x02, 0x50, 0x00, 0x05]);
    let event = HciEvent::new(EVT_LE_META_EVENT, params);
    let established = PerAdvSyncEstablished::parse(&event).unwrap();
    assert_eq!(established.sync_handle, 0x0001);
    assert_eq!(established.sid, 3);
    assert_eq!(established.advertiser.kind, AddressType::Random);
    assert_eq!(established.phy, 0x02);
    assert_eq!(established.interval, 0x0050);
    assert_eq!(established.clock_accuracy, 0x05);

    let event = HciEvent::new(
        EVT_LE_META_EVENT,
        vec![EVT_LE_PER_ADVERTISING_REPORT, 0x01, 0x00, 0x7F, 0xC4, 0xFF, DATA_STATUS_PARTIAL, 2, 0xAB, 0xCD],
    );
    let report = PerAdvReport::parse(&event).unwrap();
    assert_eq!(report.sync_handle, 1);
    assert_eq!(report.rssi, -60);
    assert_eq!(report.data_status, DATA_STATUS_PARTIAL);
    assert_eq!(report.data, vec![0xAB, 0xCD]);

    // Declared data length beyond the event
    let event = HciEvent::new(
        EVT_LE_META_EVENT,
        vec![EVT_LE_PER_ADVERTISING_REPORT, 0x01, 0x00, 0x7F, 0xC4, 0xFF, 0, 9, 0xAB],
    );
    assert!(PerAdvReport::parse(&event).is_none());

    let event = HciEvent::new(EVT_LE_META_EVENT, vec![EVT_LE_PER_ADV_SYNC_LOST, 0x01, 0x00]);
    assert_eq!(PerAdvSyncLost::parse(&event).unwrap().sync_handle, 1);
    assert!(PerAdvSyncEstablished::parse(&event).is_none());

    let event = HciEvent::new(EVT_LE_META_EVENT, vec![EVT_LE_ADV_SET_TERMINATED, 0x00, 0x02, 0x40, 0x00, 0x00]);
    let terminated = AdvSetTerminated::parse(&event).unwrap();
    assert_eq!(terminated.adv_handle, 2);
    assert_eq!(terminated.conn_handle, 0x0040);

    let event = HciEvent::new(EVT_NUM_COMPLETED_PACKETS, vec![2, 0x40, 0x00, 3, 0x00, 0x41, 0x10, 1, 0x00]);
    assert_eq!(
        NumCompletedPackets::parse(&event).unwrap().entries,
        vec![(0x0040, 3), (0x0041, 1)]
    );
}

#[test]
fn test_security_event_parsing() {
    let data = [EVT_ENCRYPTION_CHANGE, 4, 0x00, 0x41, 0x00, 0x01];
    let event = HciEvent::parse(&data).unwrap();
    assert_eq!(
        EncryptionChange::parse(&event),
        Some(EncryptionChange {
            status: 0,
            connection_handle: 0x0041,
            enabled: true,
        })
    );
    assert!(LtkRequest::parse(&event).is_none());

    let mut data = vec![EVT_LE_META_EVENT, 13, EVT_LE_LTK_REQUEST, 0x41, 0x00];
    data.extend_from_slice(&0x0102_0304_0506_0708u64.to_le_bytes());
    data.extend_from_slice(&[0x34, 0x12]);
    let event = HciEvent::parse(&data).unwrap();
    let request = LtkRequest::parse(&event).unwrap();
    assert_eq!(request.connection_handle, 0x0041);
    assert_eq!(request.rand, 0x0102_0304_0506_0708);
    assert_eq!(request.ediv, 0x1234);
}
