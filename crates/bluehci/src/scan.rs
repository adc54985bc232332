//! LE scanning
//!
//! Controllers with extended advertising are scanned with the extended
//! command family, since they refuse legacy scan commands once extended
//! advertising commands were used. Others fall back to legacy scanning.
//! Advertising reports received while a scan runs are decoded into
//! [`HostEvent::AdvertisingReport`]s; fragmented extended reports are
//! reassembled first.

use crate::config::HostConfig;
use crate::device::{DevFlags, DeviceState};
use crate::error::{HciError, Result};
use crate::event::{AdvertisingReport, EventSink, HostEvent};
use crate::gap::*;
use crate::hci::constants::*;
use crate::hci::dispatch::Dispatcher;
use crate::hci::{HciCommand, LeAdvertisingReport, LeExtAdvertisingReport};
use crate::periodic::Reassembly;
use log::{debug, trace, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Largest extended advertising data a controller reports
const EXT_ADV_DATA_MAX: usize = 1650;

/// Fragments of the extended report currently being received
#[derive(Debug)]
struct PendingReport {
    source: Option<(LeAddr, u8)>,
    buffer: Reassembly,
}

/// Scan state lives in the device flags
pub struct Scanner {
    device: Arc<DeviceState>,
    dispatcher: Arc<Dispatcher>,
    timeout: Duration,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("scanning", &self.is_scanning())
            .finish()
    }
}

impl Scanner {
    pub fn new(config: &HostConfig, device: Arc<DeviceState>, dispatcher: Arc<Dispatcher>, events: EventSink) -> Self {
        let reporting = device.clone();
        let sink = events.clone();
        dispatcher.register_le_handler(
            EVT_LE_ADVERTISING_REPORT,
            Box::new(move |event| {
                if !reporting.flags().contains(DevFlags::SCANNING) {
                    trace!("advertising report outside of a scan");
                    return;
                }
                match LeAdvertisingReport::parse_from_event(event) {
                    Ok(reports) => {
                        for report in reports {
                            sink.emit(HostEvent::AdvertisingReport(decode_report(&report)));
                        }
                    }
                    Err(e) => warn!("malformed advertising report: {}", e),
                }
            }),
        );

        let reporting = device.clone();
        let pending = Mutex::new(PendingReport {
            source: None,
            buffer: Reassembly::new(EXT_ADV_DATA_MAX),
        });
        dispatcher.register_le_handler(
            EVT_LE_EXT_ADVERTISING_REPORT,
            Box::new(move |event| {
                if !reporting.flags().contains(DevFlags::SCANNING) {
                    trace!("extended advertising report outside of a scan");
                    return;
                }
                let reports = match LeExtAdvertisingReport::parse_from_event(event) {
                    Ok(reports) => reports,
                    Err(e) => {
                        warn!("malformed extended advertising report: {}", e);
                        return;
                    }
                };
                let mut pending = pending.lock().unwrap_or_else(|e| e.into_inner());
                for report in reports {
                    let address = LeAddr::new(AddressType::from(report.address_type), BdAddr::new(report.address));
                    let source = Some((address, report.sid));
                    if pending.source != source {
                        // Another advertiser interrupts: its predecessor's fragments are lost
                        pending.buffer.clear();
                        pending.source = source;
                    }
                    let Some(data) = pending.buffer.push(report.data_status(), &report.data) else {
                        continue;
                    };
                    events.emit(HostEvent::AdvertisingReport(AdvertisingReport {
                        event_type: report.adv_type(),
                        address,
                        rssi: report.rssi,
                        data: parse_advertising_data(&data),
                    }));
                }
            }),
        );

        Self {
            device,
            dispatcher,
            timeout: config.command_timeout(),
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.device.flags().contains(DevFlags::SCANNING)
    }

    fn extended(&self) -> bool {
        self.device.read_info().has_le_feature(LE_FEAT_EXT_ADV)
    }

    /// Start scanning
    pub fn start(&self, active: bool, filter_duplicates: bool) -> Result<()> {
        if !self.device.is_ready() {
            return Err(HciError::Precondition("controller not ready"));
        }
        if self.device.flags().test_and_set(DevFlags::EXPLICIT_SCAN) {
            return Err(HciError::Precondition("scan already running"));
        }

        let own_address_type = match self.device.identity(0) {
            Some(LeAddr {
                kind: AddressType::Public | AddressType::PublicIdentity,
                ..
            }) => PUBLIC_DEVICE_ADDRESS,
            _ => RANDOM_DEVICE_ADDRESS,
        };
        let scan_type = if active { LE_SCAN_ACTIVE } else { LE_SCAN_PASSIVE };
        let (params, enable) = if self.extended() {
            (
                HciCommand::LeSetExtScanParameters {
                    own_address_type,
                    filter_policy: 0,
                    scan_type,
                    scan_interval: LE_SCAN_INTERVAL,
                    scan_window: LE_SCAN_WINDOW,
                },
                HciCommand::LeSetExtScanEnable {
                    enable: true,
                    filter_duplicates,
                    duration: 0,
                    period: 0,
                },
            )
        } else {
            (
                HciCommand::LeSetScanParameters {
                    scan_type,
                    scan_interval: LE_SCAN_INTERVAL,
                    scan_window: LE_SCAN_WINDOW,
                    own_address_type,
                    filter_policy: 0,
                },
                HciCommand::LeSetScanEnable {
                    enable: true,
                    filter_duplicates,
                },
            )
        };

        let started = self
            .dispatcher
            .command(&params, self.timeout)
            .and_then(|_| self.dispatcher.command(&enable, self.timeout));
        if let Err(e) = started {
            self.device.flags().clear(DevFlags::EXPLICIT_SCAN);
            return Err(e);
        }

        let flags = self.device.flags();
        flags.assign(DevFlags::ACTIVE_SCAN, active);
        flags.assign(DevFlags::SCAN_FILTER_DUP, filter_duplicates);
        flags.set(DevFlags::SCANNING);
        debug!("{} scan started", if active { "active" } else { "passive" });
        Ok(())
    }

    /// Stop a running scan
    pub fn stop(&self) -> Result<()> {
        if !self.device.flags().contains(DevFlags::SCANNING) {
            return Err(HciError::Precondition("no scan running"));
        }
        let disable = if self.extended() {
            HciCommand::LeSetExtScanEnable {
                enable: false,
                filter_duplicates: false,
                duration: 0,
                period: 0,
            }
        } else {
            HciCommand::LeSetScanEnable {
                enable: false,
                filter_duplicates: false,
            }
        };
        self.dispatcher.command(&disable, self.timeout)?;
        self.device.flags().clear(
            DevFlags::SCANNING | DevFlags::EXPLICIT_SCAN | DevFlags::ACTIVE_SCAN | DevFlags::SCAN_FILTER_DUP,
        );
        debug!("scan stopped");
        Ok(())
    }
}

fn decode_report(report: &LeAdvertisingReport) -> AdvertisingReport {
    AdvertisingReport {
        event_type: report.event_type,
        address: LeAddr::new(AddressType::from(report.address_type), BdAddr::new(report.address)),
        rssi: report.rssi,
        data: parse_advertising_data(&report.data),
    }
}

/// Split advertising data into `(type, data)` pairs
///
/// Parsing stops at a zero length or at a structure running past the end.
pub fn parse_advertising_data(data: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut result = Vec::new();
    let mut i = 0;

    while i < data.len() {
        let length = data[i] as usize;
        if length == 0 || i + length >= data.len() {
            break;
        }

        let ad_type = data[i + 1];
        let ad_data = data[i + 2..i + 1 + length].to_vec();
        result.push((ad_type, ad_data));

        i += 1 + length;
    }

    result
}
