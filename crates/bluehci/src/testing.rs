//! Scripted controller used by the unit tests

use crate::bringup::BringUp;
use crate::config::HostConfig;
use crate::device::DeviceState;
use crate::event::{EventSink, HostEvent};
use crate::flow::FlowControl;
use crate::hci::constants::*;
use crate::hci::dispatch::Dispatcher;
use crate::hci::packet::{HciEvent, HciPacket};
use crate::settings::{IdentityStore, MemoryStore};
use crate::transport::{ControllerEnd, MemoryTransport};
use crate::work::Scheduler;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// What the simulated controller reports about itself
#[derive(Debug, Clone)]
pub(crate) struct Profile {
    pub features: [u8; 8],
    pub le_features: [u8; 8],
    pub supported_commands: [u8; 64],
    pub bd_addr: [u8; 6],
    pub acl_mtu: u16,
    pub acl_pkts: u16,
    pub le_acl_mtu: u16,
    pub le_acl_pkts: u8,
    pub iso_mtu: u16,
    pub iso_pkts: u8,
    /// Opcodes answered with a failing status
    pub failures: HashMap<u16, u8>,
}

impl Default for Profile {
    /// LE only controller with extended and periodic advertising
    fn default() -> Self {
        let mut features = [0u8; 8];
        features[FEAT_LE_SUPPORTED.0] |= FEAT_LE_SUPPORTED.1;
        features[FEAT_BREDR_NOT_SUPPORTED.0] |= FEAT_BREDR_NOT_SUPPORTED.1;
        let mut le_features = [0u8; 8];
        le_features[LE_FEAT_EXT_ADV.0] |= LE_FEAT_EXT_ADV.1;
        le_features[LE_FEAT_PER_ADV.0] |= LE_FEAT_PER_ADV.1;
        let mut supported_commands = [0u8; 64];
        supported_commands[CMD_LE_ENCRYPT.0] |= CMD_LE_ENCRYPT.1;

        Self {
            features,
            le_features,
            supported_commands,
            bd_addr: [0x66, 0x55, 0x44, 0x33, 0x22, 0x11],
            acl_mtu: 1021,
            acl_pkts: 6,
            le_acl_mtu: 251,
            le_acl_pkts: 8,
            iso_mtu: 0,
            iso_pkts: 0,
            failures: HashMap::new(),
        }
    }
}

/// Commands the controller answers with Command Status
fn uses_command_status(opcode: u16) -> bool {
    opcode == OP_LE_PER_ADV_CREATE_SYNC || opcode == opcode_of(OGF_LINK_CTL, OCF_DISCONNECT)
}

fn opcode_of(ogf: u8, ocf: u16) -> u16 {
    opcode(ogf, ocf)
}

pub(crate) fn command_complete(opcode: u16, return_params: &[u8]) -> Vec<u8> {
    let mut params = vec![1];
    params.extend_from_slice(&opcode.to_le_bytes());
    params.extend_from_slice(return_params);
    HciEvent::new(EVT_CMD_COMPLETE, params).to_packet()
}

pub(crate) fn command_status(opcode: u16, status: u8) -> Vec<u8> {
    let mut params = vec![status, 1];
    params.extend_from_slice(&opcode.to_le_bytes());
    HciEvent::new(EVT_CMD_STATUS, params).to_packet()
}

pub(crate) fn le_meta(subevent: u8, params: &[u8]) -> Vec<u8> {
    let mut all = vec![subevent];
    all.extend_from_slice(params);
    HciEvent::new(EVT_LE_META_EVENT, all).to_packet()
}

impl Profile {
    fn return_params(&self, opcode: u16, params: &[u8]) -> Vec<u8> {
        let mut rp = vec![HCI_SUCCESS];
        match opcode {
            OP_READ_LOCAL_VERSION_INFO => {
                rp.extend_from_slice(&[0x0C, 0x34, 0x12, 0x0C, 0x59, 0x00, 0x78, 0x56]);
            }
            OP_READ_LOCAL_FEATURES => rp.extend_from_slice(&self.features),
            OP_READ_SUPPORTED_COMMANDS => rp.extend_from_slice(&self.supported_commands),
            OP_LE_READ_LOCAL_FEATURES => rp.extend_from_slice(&self.le_features),
            OP_LE_READ_BUFFER_SIZE => {
                rp.extend_from_slice(&self.le_acl_mtu.to_le_bytes());
                rp.push(self.le_acl_pkts);
            }
            OP_LE_READ_BUFFER_SIZE_V2 => {
                rp.extend_from_slice(&self.le_acl_mtu.to_le_bytes());
                rp.push(self.le_acl_pkts);
                rp.extend_from_slice(&self.iso_mtu.to_le_bytes());
                rp.push(self.iso_pkts);
            }
            OP_READ_BUFFER_SIZE => {
                rp.extend_from_slice(&self.acl_mtu.to_le_bytes());
                rp.push(64);
                rp.extend_from_slice(&self.acl_pkts.to_le_bytes());
                rp.extend_from_slice(&1u16.to_le_bytes());
            }
            OP_READ_BD_ADDR => rp.extend_from_slice(&self.bd_addr),
            OP_VS_READ_VERSION_INFO => {
                rp.extend_from_slice(&[0x02, 0x00, 0x01, 0x00, 0x03, 0x01, 0x10, 0x00, 0x2A, 0x00, 0x00, 0x00]);
            }
            OP_VS_READ_SUPPORTED_COMMANDS => {
                let mut commands = [0u8; 64];
                commands[0] = 0x07;
                rp.extend_from_slice(&commands);
            }
            OP_VS_READ_SUPPORTED_FEATURES => rp.extend_from_slice(&[0x01, 0, 0, 0, 0, 0, 0, 0]),
            op if op == opcode_of(OGF_LE, OCF_LE_ENCRYPT) => {
                // Not AES, but deterministic and key dependent
                let (key, plaintext) = params.split_at(16);
                rp.extend(key.iter().zip(plaintext).map(|(k, p)| k ^ p));
            }
            _ => {}
        }
        rp
    }

    /// Response frames to one host frame
    pub fn respond(&self, frame: &[u8]) -> Vec<Vec<u8>> {
        let Ok(HciPacket::Command { opcode, parameters }) = HciPacket::parse(frame) else {
            return Vec::new();
        };

        if let Some(&status) = self.failures.get(&opcode) {
            return vec![if uses_command_status(opcode) {
                command_status(opcode, status)
            } else {
                command_complete(opcode, &[status])
            }];
        }
        if uses_command_status(opcode) {
            return vec![command_status(opcode, HCI_SUCCESS)];
        }
        vec![command_complete(opcode, &self.return_params(opcode, &parameters))]
    }
}

pub(crate) fn opcode_of_frame(frame: &[u8]) -> Option<u16> {
    match HciPacket::parse(frame) {
        Ok(HciPacket::Command { opcode, .. }) => Some(opcode),
        _ => None,
    }
}

/// Answer every command the host writes, inline, until it stops writing
///
/// Returns the opcodes seen in order.
pub(crate) fn answer_pending(end: &ControllerEnd, dispatcher: &Dispatcher, profile: &Profile) -> Vec<u16> {
    let mut seen = Vec::new();
    while let Some(frame) = end.try_recv() {
        if let Some(opcode) = opcode_of_frame(&frame) {
            seen.push(opcode);
        }
        for response in profile.respond(&frame) {
            let _ = dispatcher.on_frame_received(&response);
        }
    }
    seen
}

/// Controller answering from a background thread
pub(crate) struct Responder {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    pub profile: Arc<Mutex<Profile>>,
    pub seen: Arc<Mutex<Vec<(u16, Vec<u8>)>>>,
}

impl Responder {
    pub fn spawn(end: ControllerEnd, dispatcher: Arc<Dispatcher>, profile: Profile) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let profile = Arc::new(Mutex::new(profile));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let worker = {
            let stop = stop.clone();
            let profile = profile.clone();
            let seen = seen.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    let Some(frame) = end.recv_timeout(Duration::from_millis(5)) else {
                        continue;
                    };
                    if let Ok(HciPacket::Command { opcode, parameters }) = HciPacket::parse(&frame) {
                        seen.lock().unwrap().push((opcode, parameters));
                    }
                    let responses = profile.lock().unwrap().respond(&frame);
                    for response in responses {
                        let _ = dispatcher.on_frame_received(&response);
                    }
                }
            })
        };

        Self {
            stop,
            worker: Some(worker),
            profile,
            seen,
        }
    }

    pub fn fail(&self, opcode: u16, status: u8) {
        self.profile.lock().unwrap().failures.insert(opcode, status);
    }

    pub fn opcodes(&self) -> Vec<u16> {
        self.seen.lock().unwrap().iter().map(|(op, _)| *op).collect()
    }

    /// Parameters of the last command with `opcode`
    pub fn last_params(&self, opcode: u16) -> Option<Vec<u8>> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(op, _)| *op == opcode)
            .map(|(_, params)| params.clone())
    }

    pub fn clear(&self) {
        self.seen.lock().unwrap().clear();
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Poll `cond` until it holds or `timeout` passes
pub(crate) fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Core components over a brought up simulated controller
pub(crate) struct Stack {
    pub config: HostConfig,
    pub device: Arc<DeviceState>,
    pub dispatcher: Arc<Dispatcher>,
    pub scheduler: Arc<Scheduler>,
    pub events: EventSink,
    pub recorded: Arc<Mutex<Vec<HostEvent>>>,
    pub bringup: Arc<BringUp>,
    pub responder: Responder,
}

impl Stack {
    pub fn ready(config: HostConfig, profile: Profile) -> Self {
        let (transport, controller) = MemoryTransport::new();
        let flow = Arc::new(FlowControl::new());
        let device = Arc::new(DeviceState::new(&config, flow.clone()));
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(transport), flow));

        let events = EventSink::new();
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = recorded.clone();
        events.set_callback(Arc::new(Mutex::new(move |event: &HostEvent| {
            sink.lock().unwrap().push(event.clone());
        })));

        let bringup = BringUp::new(
            &config,
            device.clone(),
            dispatcher.clone(),
            IdentityStore::new(Arc::new(MemoryStore::new())),
            events.clone(),
        );
        bringup.start().unwrap();
        answer_pending(&controller, &dispatcher, &profile);
        assert!(device.is_ready(), "simulated bring-up did not finish");
        recorded.lock().unwrap().clear();

        let responder = Responder::spawn(controller, dispatcher.clone(), profile);
        Self {
            config,
            device,
            dispatcher,
            scheduler: Arc::new(Scheduler::new()),
            events,
            recorded,
            bringup,
            responder,
        }
    }

    /// Feed a controller frame through the dispatcher
    pub fn inject(&self, frame: &[u8]) {
        self.dispatcher.on_frame_received(frame).unwrap();
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.recorded.lock().unwrap().clone()
    }
}
