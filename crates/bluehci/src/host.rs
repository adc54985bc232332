//! Host facade
//!
//! [`Host`] builds the core components over one transport and one settings
//! store, wires the controller events they share and runs the reader thread
//! that feeds the dispatcher.

use crate::adv::Advertising;
use crate::bringup::BringUp;
use crate::config::HostConfig;
use crate::device::DeviceState;
use crate::error::{HciError, Result};
use crate::event::{EventCallback, EventSink, HostEvent, PairingHandler};
use crate::flow::{FlowControl, LinkClass};
use crate::gap::{LeAddr, Role};
use crate::hci::constants::*;
use crate::hci::dispatch::Dispatcher;
use crate::hci::packet::HciCommand;
use crate::hci::events::{DisconnectionComplete, EncryptionChange, LeConnectionComplete, LtkRequest};
use crate::periodic::PeriodicSyncs;
use crate::scan::Scanner;
use crate::settings::{IdentityStore, SettingsStore};
use crate::transport::Transport;
use crate::work::Scheduler;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const READ_POLL: Duration = Duration::from_millis(100);

type SharedPairing = Arc<RwLock<Option<Arc<dyn PairingHandler>>>>;

/// A Bluetooth host core bound to one controller
pub struct Host {
    config: HostConfig,
    device: Arc<DeviceState>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<Scheduler>,
    events: EventSink,
    identities: IdentityStore,
    bringup: Arc<BringUp>,
    advertising: Arc<Advertising>,
    periodic: Arc<PeriodicSyncs>,
    scanner: Scanner,
    pairing: SharedPairing,
    /// Open connections and their roles
    connections: Arc<Mutex<HashMap<u16, Role>>>,
    running: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("state", &self.bringup.state())
            .field("flags", &self.device.flags().load())
            .finish()
    }
}

fn lock_connections(connections: &Mutex<HashMap<u16, Role>>) -> MutexGuard<'_, HashMap<u16, Role>> {
    connections.lock().unwrap_or_else(|e| e.into_inner())
}

impl Host {
    /// Build the host; nothing is sent until [`Host::enable`]
    pub fn new(config: HostConfig, transport: Arc<dyn Transport>, store: Arc<dyn SettingsStore>) -> Result<Arc<Self>> {
        config.validate()?;

        let flow = Arc::new(FlowControl::new());
        let device = Arc::new(DeviceState::new(&config, flow.clone()));
        let dispatcher = Arc::new(Dispatcher::new(transport, flow));
        let scheduler = Arc::new(Scheduler::new());
        let events = EventSink::new();
        let identities = IdentityStore::new(store);

        let bringup = BringUp::new(
            &config,
            device.clone(),
            dispatcher.clone(),
            identities.clone(),
            events.clone(),
        );
        let advertising = Advertising::new(
            &config,
            device.clone(),
            dispatcher.clone(),
            scheduler.clone(),
            events.clone(),
        );
        let periodic = PeriodicSyncs::new(&config, device.clone(), dispatcher.clone(), events.clone());
        let scanner = Scanner::new(&config, device.clone(), dispatcher.clone(), events.clone());

        let host = Arc::new(Self {
            config,
            device,
            dispatcher,
            scheduler,
            events,
            identities,
            bringup,
            advertising,
            periodic,
            scanner,
            pairing: Arc::new(RwLock::new(None)),
            connections: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
        });
        host.register_handlers();
        Ok(host)
    }

    fn register_handlers(&self) {
        for subevent in [EVT_LE_CONN_COMPLETE, EVT_LE_ENH_CONN_COMPLETE] {
            let device = self.device.clone();
            let advertising = Arc::downgrade(&self.advertising);
            let events = self.events.clone();
            let connections = self.connections.clone();
            self.dispatcher.register_le_handler(
                subevent,
                Box::new(move |event| {
                    let Some(cc) = LeConnectionComplete::parse(event) else {
                        warn!("malformed LE connection complete event");
                        return;
                    };
                    if cc.status != HCI_SUCCESS {
                        debug!("LE connection failed: 0x{:02x}", cc.status);
                        return;
                    }

                    lock_connections(&connections).insert(cc.connection_handle, cc.role);
                    device.connection_opened();
                    device.flow().register_link(cc.connection_handle, LinkClass::Acl);
                    info!("connected to {} as {:?}, handle 0x{:04x}", cc.peer, cc.role, cc.connection_handle);

                    // Peripheral connections are reported with their advertising set
                    let cached = advertising.upgrade().map_or(false, |adv| adv.cache_connection(&cc));
                    if !cached {
                        events.emit(HostEvent::Connected {
                            handle: cc.connection_handle,
                            role: cc.role,
                            peer: cc.peer,
                            adv_handle: None,
                            identity: None,
                        });
                    }
                }),
            );
        }

        {
            let device = self.device.clone();
            let advertising = Arc::downgrade(&self.advertising);
            let events = self.events.clone();
            let connections = self.connections.clone();
            self.dispatcher.register_event_handler(
                EVT_DISCONN_COMPLETE,
                Box::new(move |event| {
                    let Some(dc) = DisconnectionComplete::parse(event) else {
                        warn!("malformed disconnection complete event");
                        return;
                    };
                    if dc.status != HCI_SUCCESS {
                        warn!("disconnection of 0x{:04x} failed: 0x{:02x}", dc.connection_handle, dc.status);
                        return;
                    }
                    if lock_connections(&connections).remove(&dc.connection_handle).is_none() {
                        debug!("disconnection for unknown handle 0x{:04x}", dc.connection_handle);
                        return;
                    }

                    device.flow().unregister_link(dc.connection_handle);
                    device.connection_closed();
                    info!("handle 0x{:04x} disconnected: 0x{:02x}", dc.connection_handle, dc.reason);
                    events.emit(HostEvent::Disconnected {
                        handle: dc.connection_handle,
                        reason: dc.reason,
                    });
                    if let Some(advertising) = advertising.upgrade() {
                        advertising.on_disconnected(dc.connection_handle);
                    }
                }),
            );
        }

        let events = self.events.clone();
        self.dispatcher.register_event_handler(
            EVT_HARDWARE_ERROR,
            Box::new(move |event| {
                let code = event.parameters.first().copied().unwrap_or(0);
                error!("controller hardware error 0x{:02x}", code);
                events.emit(HostEvent::HardwareError { code });
            }),
        );

        let events = self.events.clone();
        self.dispatcher.register_event_handler(
            EVT_DATA_BUF_OVERFLOW,
            Box::new(move |event| {
                let link_type = event.parameters.first().copied().unwrap_or(0);
                warn!("controller data buffer overflow, link type {}", link_type);
                events.emit(HostEvent::DataBufferOverflow { link_type });
            }),
        );

        let pairing = self.pairing.clone();
        self.dispatcher.register_event_handler(
            EVT_ENCRYPTION_CHANGE,
            Box::new(move |event| {
                let Some(change) = EncryptionChange::parse(event) else {
                    warn!("malformed encryption change event");
                    return;
                };
                match pairing.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
                    Some(handler) => handler.encryption_changed(change.connection_handle, change.status, change.enabled),
                    None => debug!("encryption change on 0x{:04x} with no pairing handler", change.connection_handle),
                }
            }),
        );

        let pairing = self.pairing.clone();
        self.dispatcher.register_le_handler(
            EVT_LE_LTK_REQUEST,
            Box::new(move |event| {
                let Some(request) = LtkRequest::parse(event) else {
                    warn!("malformed LTK request event");
                    return;
                };
                match pairing.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
                    Some(handler) => handler.ltk_requested(request.connection_handle, request.rand, request.ediv),
                    None => warn!("LTK request on 0x{:04x} with no pairing handler", request.connection_handle),
                }
            }),
        );

        let advertising = self.advertising.clone();
        let periodic = self.periodic.clone();
        let device = self.device.clone();
        let connections = self.connections.clone();
        self.bringup.add_reset_hook(Box::new(move || {
            for (handle, _) in lock_connections(&connections).drain() {
                device.flow().unregister_link(handle);
            }
            advertising.on_stack_reset();
            periodic.on_stack_reset();
        }));

        let advertising = self.advertising.clone();
        self.bringup.add_ready_hook(Box::new(move || advertising.schedule_resume()));
    }

    /// Start bring-up; readiness is reported with [`HostEvent::Ready`]
    pub fn enable(&self) -> Result<()> {
        self.bringup.start()
    }

    /// Bring the controller up and wait for it to become ready
    pub fn enable_blocking(&self, timeout: Duration) -> Result<()> {
        self.bringup.start()?;
        self.bringup.wait_ready(timeout)
    }

    pub fn is_ready(&self) -> bool {
        self.device.is_ready()
    }

    /// Feed one frame from the controller
    pub fn on_frame_received(&self, frame: &[u8]) -> Result<()> {
        self.dispatcher.on_frame_received(frame)
    }

    /// Read frames from the transport on a dedicated thread
    ///
    /// The thread is the dispatch context: every handler runs on it.
    pub fn spawn_reader(&self) -> Result<()> {
        let mut reader = self.reader.lock().unwrap_or_else(|e| e.into_inner());
        if reader.is_some() {
            return Err(HciError::Busy("reader already running"));
        }

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let dispatcher = self.dispatcher.clone();
        let handle = thread::Builder::new()
            .name("bluehci-rx".into())
            .spawn(move || read_loop(&dispatcher, &running))?;
        *reader = Some(handle);
        Ok(())
    }

    /// Stop the reader thread and the deferred work queue
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let reader = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(reader) = reader {
            if reader.thread().id() != thread::current().id() {
                let _ = reader.join();
            }
        }
        self.scheduler.shutdown();
        debug!("host shut down");
    }

    /// Ask the controller to close a connection
    ///
    /// The connection is gone once [`HostEvent::Disconnected`] arrives.
    pub fn disconnect(&self, handle: u16, reason: u8) -> Result<()> {
        if !lock_connections(&self.connections).contains_key(&handle) {
            return Err(HciError::InvalidInput(format!("no connection 0x{:04x}", handle)));
        }
        self.dispatcher
            .command(&HciCommand::Disconnect { handle, reason }, self.config.command_timeout())?;
        Ok(())
    }

    /// Send one ACL payload, waiting for a controller buffer
    pub fn send_data(&self, handle: u16, payload: Vec<u8>) -> Result<()> {
        self.dispatcher
            .send_data(handle, payload, Some(self.config.command_timeout()))
    }

    pub fn set_event_callback(&self, callback: EventCallback) {
        self.events.set_callback(callback);
    }

    pub fn set_pairing_handler(&self, handler: Arc<dyn PairingHandler>) {
        *self.pairing.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Add an identity, persisting it right away once the stack is ready
    pub fn add_identity(&self, addr: LeAddr) -> Result<usize> {
        let id = self.device.add_identity(addr)?;
        self.identities.commit(&self.device)?;
        Ok(id)
    }

    /// Rename the device, persisting the name once the stack is ready
    pub fn set_name(&self, name: &str) -> Result<()> {
        self.device.set_name(name)?;
        self.identities.commit(&self.device)?;
        Ok(())
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<DeviceState> {
        &self.device
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn bringup(&self) -> &Arc<BringUp> {
        &self.bringup
    }

    pub fn advertising(&self) -> &Arc<Advertising> {
        &self.advertising
    }

    pub fn periodic(&self) -> &Arc<PeriodicSyncs> {
        &self.periodic
    }

    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    pub fn identities(&self) -> &IdentityStore {
        &self.identities
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn read_loop(dispatcher: &Dispatcher, running: &AtomicBool) {
    debug!("reader started");
    while running.load(Ordering::SeqCst) {
        match dispatcher.transport().read(Some(READ_POLL)) {
            Ok(Some(frame)) => {
                // Malformed frames are logged by the dispatcher and skipped
                let _ = dispatcher.on_frame_received(&frame);
            }
            Ok(None) => {}
            Err(HciError::TransportClosed) => {
                info!("transport closed");
                break;
            }
            Err(e) => {
                error!("transport read failed: {}", e);
                break;
            }
        }
    }
    running.store(false, Ordering::SeqCst);
    debug!("reader stopped");
}
