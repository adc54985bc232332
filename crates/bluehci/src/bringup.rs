//! Controller bring-up
//!
//! Bring-up walks the controller from power-on to a ready, flow-controlled
//! state:
//!
//! ```text
//! NONE -> BOOTING -> PREPARING -> INITIALIZING -> READY
//! ```
//!
//! It is event driven. Each step issues one command through
//! [`Dispatcher::queue_command`] and the next step runs from the completion
//! handler, in the dispatch context, so nothing here ever blocks on the
//! controller. Callers that want to wait use [`BringUp::wait_ready`].

use crate::config::HostConfig;
use crate::device::{DevFlags, DeviceState, VsVersion, VS_CMDS_MAX, VS_FEAT_MAX};
use crate::error::{HciError, Result};
use crate::event::{EventSink, HostEvent};
use crate::flow::LinkClass;
use crate::gap::{AddressType, BdAddr, LeAddr};
use crate::hci::constants::*;
use crate::hci::dispatch::{Completion, Dispatcher};
use crate::hci::packet::HciCommand;
use crate::settings::IdentityStore;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, info, trace, warn};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

/// Bring-up progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringUpState {
    None,
    Booting,
    Preparing,
    Initializing,
    Ready,
}

/// One command of the common initialization sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStep {
    Reset,
    ReadLocalFeatures,
    ReadLocalVersion,
    ReadSupportedCommands,
    VsReadVersionInfo,
    VsReadSupportedCommands,
    VsReadSupportedFeatures,
    LeReadLocalFeatures,
    LeReadBufferSize,
    WriteLeHostSupport,
    LeSetEventMask,
    ReadBufferSize,
    SetEventMask,
    ReadBdAddr,
    SetRandomAddress,
}

const SEQUENCE: [InitStep; 15] = [
    InitStep::Reset,
    InitStep::ReadLocalFeatures,
    InitStep::ReadLocalVersion,
    InitStep::ReadSupportedCommands,
    InitStep::VsReadVersionInfo,
    InitStep::VsReadSupportedCommands,
    InitStep::VsReadSupportedFeatures,
    InitStep::LeReadLocalFeatures,
    InitStep::LeReadBufferSize,
    InitStep::WriteLeHostSupport,
    InitStep::LeSetEventMask,
    InitStep::ReadBufferSize,
    InitStep::SetEventMask,
    InitStep::ReadBdAddr,
    InitStep::SetRandomAddress,
];

/// What the step conditions depend on
#[derive(Debug, Clone, Copy)]
pub struct StepContext {
    pub le: bool,
    pub bredr: bool,
    pub le_acl_mtu: u16,
    pub vendor_extensions: bool,
    pub random_identity: bool,
}

impl InitStep {
    /// Whether the step runs for this controller
    pub fn applies(self, ctx: &StepContext) -> bool {
        match self {
            InitStep::VsReadVersionInfo
            | InitStep::VsReadSupportedCommands
            | InitStep::VsReadSupportedFeatures => ctx.vendor_extensions,
            InitStep::LeReadLocalFeatures | InitStep::LeReadBufferSize | InitStep::LeSetEventMask => ctx.le,
            InitStep::WriteLeHostSupport => ctx.le && ctx.bredr,
            InitStep::ReadBufferSize => ctx.bredr || ctx.le_acl_mtu == 0,
            InitStep::SetRandomAddress => ctx.random_identity,
            _ => true,
        }
    }

    /// Optional steps advance whatever the controller answers
    pub fn is_optional(self) -> bool {
        matches!(
            self,
            InitStep::VsReadVersionInfo | InitStep::VsReadSupportedCommands | InitStep::VsReadSupportedFeatures
        )
    }

    /// The step after this one, `None` once initialization is done
    pub fn next(self, ctx: &StepContext) -> Option<InitStep> {
        let position = SEQUENCE.iter().position(|step| *step == self)?;
        SEQUENCE[position + 1..]
            .iter()
            .copied()
            .find(|step| step.applies(ctx))
    }
}

/// Vendor specific preparation run before the common sequence
///
/// Every command the driver returns is optional: a failing status is logged
/// and the sequence continues.
pub trait ChipsetDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Commands to send after the preparatory reset
    fn setup_commands(&self) -> Vec<HciCommand>;
}

/// Why the last bring-up attempt failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BringUpFailure {
    pub opcode: u16,
    /// Controller status, absent when the command never reached the controller
    pub status: Option<u8>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Prepare(usize),
    Init(InitStep),
}

struct Inner {
    state: BringUpState,
    awaiting: Option<(Phase, u16)>,
    prepare: Vec<HciCommand>,
    failure: Option<BringUpFailure>,
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// The bring-up state machine
pub struct BringUp {
    device: Arc<DeviceState>,
    dispatcher: Arc<Dispatcher>,
    identities: IdentityStore,
    events: EventSink,
    privacy: bool,
    bredr: bool,
    vendor_extensions: bool,
    driver: RwLock<Option<Arc<dyn ChipsetDriver>>>,
    reset_hooks: Mutex<Vec<Hook>>,
    ready_hooks: Mutex<Vec<Hook>>,
    inner: Mutex<Inner>,
    finished: Condvar,
}

impl std::fmt::Debug for BringUp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BringUp").field("state", &self.state()).finish()
    }
}

impl BringUp {
    /// Create the state machine and claim the dispatcher's completion handler
    pub fn new(
        config: &HostConfig,
        device: Arc<DeviceState>,
        dispatcher: Arc<Dispatcher>,
        identities: IdentityStore,
        events: EventSink,
    ) -> Arc<Self> {
        let bringup = Arc::new(Self {
            device,
            dispatcher: dispatcher.clone(),
            identities,
            events,
            privacy: config.privacy,
            bredr: config.bredr,
            vendor_extensions: config.vendor_extensions,
            driver: RwLock::new(None),
            reset_hooks: Mutex::new(Vec::new()),
            ready_hooks: Mutex::new(Vec::new()),
            inner: Mutex::new(Inner {
                state: BringUpState::None,
                awaiting: None,
                prepare: Vec::new(),
                failure: None,
            }),
            finished: Condvar::new(),
        });

        let weak: Weak<BringUp> = Arc::downgrade(&bringup);
        dispatcher.set_completion_handler(Box::new(move |opcode, result| {
            if let Some(bringup) = weak.upgrade() {
                bringup.on_completion(opcode, result);
            }
        }));
        bringup
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> BringUpState {
        self.lock().state
    }

    pub fn last_failure(&self) -> Option<BringUpFailure> {
        self.lock().failure.clone()
    }

    /// Install a chipset driver; takes effect on the next [`BringUp::start`]
    pub fn set_driver(&self, driver: Arc<dyn ChipsetDriver>) {
        *self.driver.write().unwrap_or_else(|e| e.into_inner()) = Some(driver);
    }

    /// Run `hook` every time bring-up restarts, after transient state is reset
    pub fn add_reset_hook(&self, hook: Hook) {
        self.reset_hooks.lock().unwrap_or_else(|e| e.into_inner()).push(hook);
    }

    /// Run `hook` once the controller is ready, before `Ready` is emitted
    ///
    /// Hooks run in the dispatch context and must not wait on the controller.
    pub fn add_ready_hook(&self, hook: Hook) {
        self.ready_hooks.lock().unwrap_or_else(|e| e.into_inner()).push(hook);
    }

    /// Begin bring-up
    ///
    /// Returns once the first command is on its way; completion is reported
    /// through host events and [`BringUp::wait_ready`].
    pub fn start(&self) -> Result<()> {
        {
            let mut inner = self.lock();
            match inner.state {
                BringUpState::None | BringUpState::Ready => {}
                _ => return Err(HciError::Busy("bring-up already in progress")),
            }
            inner.state = BringUpState::Booting;
            inner.awaiting = None;
            inner.failure = None;
        }
        info!("controller bring-up started");

        self.device.reset_transient_state();
        self.device.flags().set(DevFlags::ENABLE);
        self.device.flow().reset_commands();
        for hook in self.reset_hooks.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            hook();
        }

        if let Err(e) = self.dispatcher.transport().open() {
            self.fail(0, None, format!("transport open failed: {}", e));
            return Err(e);
        }
        match self.identities.load(&self.device) {
            Ok(0) => {}
            Ok(count) => debug!("{} identities restored", count),
            Err(e) => warn!("failed to load stored identities: {}", e),
        }

        let driver = self.driver.read().unwrap_or_else(|e| e.into_inner()).clone();
        let (phase, command) = {
            let mut inner = self.lock();
            inner.state = BringUpState::Preparing;
            inner.prepare = match driver {
                Some(driver) => {
                    debug!("preparing controller with {} driver", driver.name());
                    let mut commands = vec![HciCommand::Reset];
                    commands.extend(driver.setup_commands());
                    commands
                }
                None => Vec::new(),
            };

            let first = match inner.prepare.first() {
                Some(command) => (Phase::Prepare(0), command.clone()),
                None => {
                    inner.state = BringUpState::Initializing;
                    (Phase::Init(InitStep::Reset), HciCommand::Reset)
                }
            };
            inner.awaiting = Some((first.0, first.1.opcode()));
            first
        };

        trace!("bring-up {:?}", phase);
        self.issue(command)
    }

    /// Block until bring-up finishes or `timeout` passes
    pub fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if inner.state == BringUpState::Ready {
                return Ok(());
            }
            if let Some(failure) = &inner.failure {
                return Err(match failure.status {
                    Some(status) => HciError::CommandFailed {
                        opcode: failure.opcode,
                        status,
                    },
                    None => HciError::Precondition("bring-up failed"),
                });
            }
            if inner.state == BringUpState::None {
                return Err(HciError::Precondition("bring-up not started"));
            }

            let now = Instant::now();
            if now >= deadline {
                let opcode = inner.awaiting.map(|(_, op)| op).unwrap_or(0);
                return Err(HciError::Timeout(opcode));
            }
            inner = self
                .finished
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    fn issue(&self, command: HciCommand) -> Result<()> {
        let opcode = command.opcode();
        self.dispatcher.queue_command(command).map_err(|e| {
            self.fail(opcode, None, format!("failed to send command: {}", e));
            e
        })
    }

    fn on_completion(&self, opcode: u16, result: Result<&Completion>) {
        let phase = {
            let inner = self.lock();
            match inner.awaiting {
                Some((phase, awaited)) if awaited == opcode => phase,
                _ => {
                    debug!("completion for 0x{:04x} outside bring-up", opcode);
                    return;
                }
            }
        };

        let completion = match result {
            Ok(completion) => completion,
            Err(e) => {
                self.fail(opcode, None, format!("failed to send command: {}", e));
                return;
            }
        };

        // A successful Command Status means the Command Complete is still to come
        if matches!(completion, Completion::Status(_)) && completion.status() == HCI_SUCCESS {
            return;
        }

        let optional = match phase {
            Phase::Prepare(_) => true,
            Phase::Init(step) => step.is_optional(),
        };

        let status = completion.status();
        if status != HCI_SUCCESS {
            if !optional {
                self.fail(opcode, Some(status), format!("controller returned status 0x{:02x}", status));
                return;
            }
            warn!("optional bring-up command 0x{:04x} failed: 0x{:02x}", opcode, status);
        } else if let Phase::Init(step) = phase {
            if let Err(e) = self.apply(step, completion) {
                if !optional {
                    self.fail(opcode, None, format!("{:?}: {}", step, e));
                    return;
                }
                warn!("ignoring bad {:?} response: {}", step, e);
            }
        }

        self.advance(phase);
    }

    fn step_context(&self) -> StepContext {
        let info = self.device.read_info();
        StepContext {
            le: info.le_capable(),
            bredr: self.bredr && info.bredr_capable(),
            le_acl_mtu: info.le_acl_mtu,
            vendor_extensions: self.vendor_extensions,
            random_identity: self
                .device
                .identity(0)
                .map_or(false, |id| matches!(id.kind, AddressType::Random | AddressType::RandomIdentity)),
        }
    }

    fn advance(&self, from: Phase) {
        let ctx = self.step_context();
        let next = {
            let mut inner = self.lock();
            let next = match from {
                Phase::Prepare(i) if i + 1 < inner.prepare.len() => {
                    Some((Phase::Prepare(i + 1), inner.prepare[i + 1].clone()))
                }
                Phase::Prepare(_) => {
                    inner.state = BringUpState::Initializing;
                    Some((Phase::Init(InitStep::Reset), HciCommand::Reset))
                }
                Phase::Init(step) => step
                    .next(&ctx)
                    .map(|next| (Phase::Init(next), self.command_for(next))),
            };
            inner.awaiting = next.as_ref().map(|(phase, command)| (*phase, command.opcode()));
            next
        };

        match next {
            Some((phase, command)) => {
                trace!("bring-up {:?}", phase);
                let _ = self.issue(command);
            }
            None => self.finish(),
        }
    }

    fn command_for(&self, step: InitStep) -> HciCommand {
        match step {
            InitStep::Reset => HciCommand::Reset,
            InitStep::ReadLocalFeatures => HciCommand::ReadLocalFeatures,
            InitStep::ReadLocalVersion => HciCommand::ReadLocalVersionInfo,
            InitStep::ReadSupportedCommands => HciCommand::ReadSupportedCommands,
            InitStep::VsReadVersionInfo => HciCommand::VsReadVersionInfo,
            InitStep::VsReadSupportedCommands => HciCommand::VsReadSupportedCommands,
            InitStep::VsReadSupportedFeatures => HciCommand::VsReadSupportedFeatures,
            InitStep::LeReadLocalFeatures => HciCommand::LeReadLocalFeatures,
            InitStep::LeReadBufferSize => {
                if self.device.read_info().supports_command(CMD_LE_READ_BUFFER_SIZE_V2) {
                    HciCommand::LeReadBufferSizeV2
                } else {
                    HciCommand::LeReadBufferSize
                }
            }
            InitStep::WriteLeHostSupport => HciCommand::WriteLeHostSupport {
                le: true,
                simultaneous: false,
            },
            InitStep::LeSetEventMask => HciCommand::LeSetEventMask {
                event_mask: self.le_event_mask(),
            },
            InitStep::ReadBufferSize => HciCommand::ReadBufferSize,
            InitStep::SetEventMask => HciCommand::SetEventMask {
                event_mask: self.event_mask(),
            },
            InitStep::ReadBdAddr => HciCommand::ReadBdAddr,
            InitStep::SetRandomAddress => HciCommand::LeSetRandomAddress {
                address: self.device.identity(0).map(|id| id.addr.bytes).unwrap_or_default(),
            },
        }
    }

    fn event_mask(&self) -> u64 {
        let mut mask = EVT_MASK_DISCONN_COMPLETE
            | EVT_MASK_ENCRYPT_CHANGE
            | EVT_MASK_HARDWARE_ERROR
            | EVT_MASK_DATA_BUF_OVERFLOW;
        if self.device.read_info().le_capable() {
            mask |= EVT_MASK_LE_META_EVENT;
        }
        mask
    }

    fn le_event_mask(&self) -> u64 {
        let info = self.device.read_info();
        let mut mask = LE_EVT_MASK_CONN_COMPLETE
            | LE_EVT_MASK_ADVERTISING_REPORT
            | LE_EVT_MASK_LTK_REQUEST
            | LE_EVT_MASK_ENH_CONN_COMPLETE;
        if info.has_le_feature(LE_FEAT_EXT_ADV) {
            mask |= LE_EVT_MASK_ADV_SET_TERMINATED
                | LE_EVT_MASK_SCAN_REQ_RECEIVED
                | LE_EVT_MASK_EXT_ADVERTISING_REPORT;
        }
        if info.has_le_feature(LE_FEAT_PER_ADV) {
            mask |= LE_EVT_MASK_PER_ADV_SYNC_ESTABLISHED
                | LE_EVT_MASK_PER_ADVERTISING_REPORT
                | LE_EVT_MASK_PER_ADV_SYNC_LOST;
        }
        mask
    }

    /// Copy the fields a completed step returned into the device state
    fn apply(&self, step: InitStep, completion: &Completion) -> Result<()> {
        let p = completion.payload();
        let need = |len: usize| {
            if p.len() < len {
                Err(HciError::InvalidParamLength(p.len()))
            } else {
                Ok(())
            }
        };
        let flow = self.device.flow();

        match step {
            InitStep::ReadLocalFeatures => {
                need(8)?;
                self.device.write_info().features.copy_from_slice(&p[..8]);
            }
            InitStep::ReadLocalVersion => {
                need(8)?;
                let mut info = self.device.write_info();
                info.hci_version = p[0];
                info.hci_revision = LittleEndian::read_u16(&p[1..3]);
                info.lmp_version = p[3];
                info.manufacturer = LittleEndian::read_u16(&p[4..6]);
                info.lmp_subversion = LittleEndian::read_u16(&p[6..8]);
                info!(
                    "controller: HCI version 0x{:02x} revision 0x{:04x}, manufacturer 0x{:04x}",
                    info.hci_version, info.hci_revision, info.manufacturer
                );
            }
            InitStep::ReadSupportedCommands => {
                need(64)?;
                self.device.write_info().supported_commands.copy_from_slice(&p[..64]);
            }
            InitStep::VsReadVersionInfo => {
                need(12)?;
                let version = VsVersion {
                    hw_platform: LittleEndian::read_u16(&p[0..2]),
                    hw_variant: LittleEndian::read_u16(&p[2..4]),
                    fw_variant: p[4],
                    fw_version: p[5],
                    fw_revision: LittleEndian::read_u16(&p[6..8]),
                    fw_build: LittleEndian::read_u32(&p[8..12]),
                };
                debug!("vendor firmware {:?}", version);
                self.device.write_info().vs_version = Some(version);
            }
            InitStep::VsReadSupportedCommands => {
                need(VS_CMDS_MAX)?;
                self.device.write_info().vs_commands.copy_from_slice(&p[..VS_CMDS_MAX]);
            }
            InitStep::VsReadSupportedFeatures => {
                need(VS_FEAT_MAX)?;
                self.device.write_info().vs_features.copy_from_slice(&p[..VS_FEAT_MAX]);
            }
            InitStep::LeReadLocalFeatures => {
                need(8)?;
                self.device.write_info().le_features.copy_from_slice(&p[..8]);
            }
            InitStep::LeReadBufferSize => {
                need(3)?;
                let mut info = self.device.write_info();
                info.le_acl_mtu = LittleEndian::read_u16(&p[0..2]);
                info.le_acl_pkts = p[2];
                if info.le_acl_mtu != 0 {
                    flow.pool(LinkClass::Acl).reset(info.le_acl_pkts as usize);
                }
                if completion.opcode() == OP_LE_READ_BUFFER_SIZE_V2 {
                    need(6)?;
                    info.iso_mtu = LittleEndian::read_u16(&p[3..5]);
                    info.iso_pkts = p[5];
                    flow.pool(LinkClass::Iso).reset(info.iso_pkts as usize);
                }
                debug!(
                    "LE ACL buffers: {} x {} bytes, ISO buffers: {} x {} bytes",
                    info.le_acl_pkts, info.le_acl_mtu, info.iso_pkts, info.iso_mtu
                );
            }
            InitStep::ReadBufferSize => {
                need(7)?;
                let mut info = self.device.write_info();
                info.acl_mtu = LittleEndian::read_u16(&p[0..2]);
                info.acl_pkts = LittleEndian::read_u16(&p[3..5]);
                // LE shares the BR/EDR buffers when it has none of its own
                if info.le_acl_mtu == 0 {
                    flow.pool(LinkClass::Acl).reset(info.acl_pkts as usize);
                }
                debug!("ACL buffers: {} x {} bytes", info.acl_pkts, info.acl_mtu);
            }
            InitStep::ReadBdAddr => {
                need(6)?;
                let addr = BdAddr::from_slice(&p[..6]).ok_or(HciError::InvalidParamLength(p.len()))?;
                self.device.write_info().public_addr = addr;
                self.resolve_identity()?;
            }
            InitStep::SetRandomAddress => {
                if let Some(id) = self.device.identity(0) {
                    self.device.set_random_address(id);
                }
            }
            InitStep::Reset | InitStep::WriteLeHostSupport | InitStep::LeSetEventMask | InitStep::SetEventMask => {}
        }
        Ok(())
    }

    /// Make sure identity 0 exists, and has an IRK when privacy is on
    fn resolve_identity(&self) -> Result<()> {
        if self.device.id_count() == 0 {
            let public = self.device.read_info().public_addr;
            let identity = if public.is_any() {
                LeAddr::random(BdAddr::new_static_random())
            } else {
                LeAddr::public(public)
            };
            self.device.add_identity(identity)?;
            self.device.flags().set(DevFlags::STORE_ID);
            info!("using identity {}", identity);
        }

        if self.privacy && self.device.irk(0).is_none() {
            self.device.set_irk(0, rand::random())?;
            self.device.flags().set(DevFlags::STORE_ID);
            debug!("generated IRK for identity 0");
        }
        Ok(())
    }

    fn finish(&self) {
        {
            let mut inner = self.lock();
            inner.state = BringUpState::Ready;
            inner.awaiting = None;
        }
        self.device.flags().set(DevFlags::READY);

        if let Err(e) = self.identities.commit(&self.device) {
            error!("failed to store identities: {}", e);
        }

        for hook in self.ready_hooks.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            hook();
        }

        info!("controller ready");
        self.events.emit(HostEvent::Ready {
            identity: self.device.identity(0),
        });
        self.finished.notify_all();
    }

    fn fail(&self, opcode: u16, status: Option<u8>, reason: String) {
        error!("bring-up failed at 0x{:04x}: {}", opcode, reason);
        {
            let mut inner = self.lock();
            inner.state = BringUpState::None;
            inner.awaiting = None;
            inner.failure = Some(BringUpFailure { opcode, status, reason });
        }
        self.device.flags().clear(DevFlags::ENABLE | DevFlags::READY);
        self.events.emit(HostEvent::BringUpFailed { opcode, status });
        self.finished.notify_all();
    }
}
