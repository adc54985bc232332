//! Inbound frame routing and outbound command/data submission
//!
//! The [`Dispatcher`] is fed every frame the transport receives, from a
//! single context, and routes it:
//!
//! - Command Complete / Command Status return command credits and resolve
//!   the waiter blocked in [`Dispatcher::command`], or go to the completion
//!   handler installed by bring-up.
//! - Number Of Completed Packets returns data credits.
//! - Other events go to handlers keyed by event code, LE meta events to
//!   handlers keyed by subevent.
//! - ACL/ISO data goes to the handler registered for its connection handle.
//!
//! Handlers run in the dispatch context and must not block. Outbound
//! commands from the dispatch context go through [`Dispatcher::queue_command`],
//! which never waits for a credit.

use crate::error::{HciError, Result};
use crate::flow::FlowControl;
use crate::hci::constants::*;
use crate::hci::events::NumCompletedPackets;
use crate::hci::packet::{
    AclPacket, CommandComplete, CommandStatus, HciCommand, HciEvent, HciPacket, IsoPacket,
};
use crate::transport::Transport;
use log::{debug, error, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

/// Handler for a decoded event
pub type EventHandler = Box<dyn Fn(&HciEvent) + Send + Sync>;

/// Handler for inbound ACL or ISO data on one connection
pub type DataHandler = Box<dyn Fn(&HciPacket) + Send + Sync>;

/// Handler for command completions nobody waits for synchronously
///
/// Receives the opcode and either the completion or the error that
/// prevented the command from reaching the controller.
pub type CompletionHandler = Box<dyn Fn(u16, Result<&Completion>) + Send + Sync>;

/// Command Complete or Command Status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Complete(CommandComplete),
    Status(CommandStatus),
}

impl Completion {
    pub fn opcode(&self) -> u16 {
        match self {
            Completion::Complete(cc) => cc.opcode,
            Completion::Status(cs) => cs.opcode,
        }
    }

    pub fn status(&self) -> u8 {
        match self {
            Completion::Complete(cc) => cc.status(),
            Completion::Status(cs) => cs.status,
        }
    }

    /// Number of commands the controller is ready to accept
    pub fn credits(&self) -> u8 {
        match self {
            Completion::Complete(cc) => cc.num_hci_command_packets,
            Completion::Status(cs) => cs.num_hci_command_packets,
        }
    }

    /// Return parameters after the status byte (empty for Command Status)
    pub fn payload(&self) -> &[u8] {
        match self {
            Completion::Complete(cc) => cc.payload(),
            Completion::Status(_) => &[],
        }
    }

    /// Turn a non-success status into an error
    pub fn into_result(self) -> Result<Completion> {
        match self.status() {
            HCI_SUCCESS => Ok(self),
            status => Err(HciError::CommandFailed {
                opcode: self.opcode(),
                status,
            }),
        }
    }
}

#[derive(Debug)]
enum Waiter {
    /// Opcode claimed, command still waiting for a credit
    Reserved,
    /// Command written; the next completion for the opcode belongs to it
    Sent,
    Done(Completion),
}

/// Routes frames between the transport and the host components
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    flow: Arc<FlowControl>,
    event_handlers: RwLock<HashMap<u8, Vec<EventHandler>>>,
    le_handlers: RwLock<HashMap<u8, Vec<EventHandler>>>,
    data_handlers: RwLock<HashMap<u16, DataHandler>>,
    completion_handler: RwLock<Option<CompletionHandler>>,
    queue: Mutex<VecDeque<HciCommand>>,
    waiters: Mutex<HashMap<u16, Waiter>>,
    completed: Condvar,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("flow", &self.flow)
            .field("queued", &self.lock_queue().len())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, flow: Arc<FlowControl>) -> Self {
        Self {
            transport,
            flow,
            event_handlers: RwLock::new(HashMap::new()),
            le_handlers: RwLock::new(HashMap::new()),
            data_handlers: RwLock::new(HashMap::new()),
            completion_handler: RwLock::new(None),
            queue: Mutex::new(VecDeque::new()),
            waiters: Mutex::new(HashMap::new()),
            completed: Condvar::new(),
        }
    }

    pub fn flow(&self) -> &Arc<FlowControl> {
        &self.flow
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<HciCommand>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_waiters(&self) -> MutexGuard<'_, HashMap<u16, Waiter>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a handler for an event code; several handlers may share a code
    pub fn register_event_handler(&self, event_code: u8, handler: EventHandler) {
        let mut handlers = self.event_handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.entry(event_code).or_default().push(handler);
    }

    /// Add a handler for an LE meta subevent
    pub fn register_le_handler(&self, subevent: u8, handler: EventHandler) {
        let mut handlers = self.le_handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.entry(subevent).or_default().push(handler);
    }

    pub fn register_data_handler(&self, handle: u16, handler: DataHandler) {
        let mut handlers = self.data_handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(handle & HCI_HANDLE_MASK, handler);
    }

    pub fn unregister_data_handler(&self, handle: u16) {
        let mut handlers = self.data_handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.remove(&(handle & HCI_HANDLE_MASK));
    }

    pub fn set_completion_handler(&self, handler: CompletionHandler) {
        let mut slot = self.completion_handler.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(handler);
    }

    /// Process one frame received from the transport
    ///
    /// Malformed frames are logged and dropped; the returned error only
    /// informs the caller, the dispatcher itself stays usable.
    pub fn on_frame_received(&self, frame: &[u8]) -> Result<()> {
        let packet = match HciPacket::parse(frame) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("dropping malformed frame ({} bytes): {}", frame.len(), e);
                return Err(e);
            }
        };

        match &packet {
            HciPacket::Event(event) => self.dispatch_event(event),
            HciPacket::Acl(acl) => self.dispatch_data(acl.handle, &packet),
            HciPacket::Iso(iso) => self.dispatch_data(iso.handle, &packet),
            HciPacket::Sco { handle, .. } => {
                trace!("dropping SCO frame for handle 0x{:04x}", handle);
            }
            HciPacket::Command { opcode, .. } => {
                warn!("controller sent a command packet (opcode 0x{:04x})", opcode);
            }
        }
        Ok(())
    }

    fn dispatch_data(&self, handle: u16, packet: &HciPacket) {
        let handlers = self.data_handlers.read().unwrap_or_else(|e| e.into_inner());
        match handlers.get(&handle) {
            Some(handler) => handler(packet),
            None => debug!("no data handler for handle 0x{:04x}, dropping", handle),
        }
    }

    fn dispatch_event(&self, event: &HciEvent) {
        match event.event_code {
            EVT_CMD_COMPLETE => match CommandComplete::parse(event) {
                Some(cc) => self.on_completion(Completion::Complete(cc)),
                None => warn!("malformed Command Complete event"),
            },
            EVT_CMD_STATUS => match CommandStatus::parse(event) {
                Some(cs) => self.on_completion(Completion::Status(cs)),
                None => warn!("malformed Command Status event"),
            },
            EVT_NUM_COMPLETED_PACKETS => match NumCompletedPackets::parse(event) {
                Some(ncp) => {
                    for (handle, count) in ncp.entries {
                        self.flow.release_data_credits(handle, count as usize);
                    }
                }
                None => warn!("malformed Number Of Completed Packets event"),
            },
            EVT_LE_META_EVENT => {
                let Some(subevent) = event.le_subevent() else {
                    warn!("empty LE meta event");
                    return;
                };
                let handlers = self.le_handlers.read().unwrap_or_else(|e| e.into_inner());
                match handlers.get(&subevent) {
                    Some(list) => list.iter().for_each(|handler| handler(event)),
                    None => debug!("unhandled LE subevent 0x{:02x}", subevent),
                }
            }
            code => {
                let handlers = self.event_handlers.read().unwrap_or_else(|e| e.into_inner());
                match handlers.get(&code) {
                    Some(list) => list.iter().for_each(|handler| handler(event)),
                    None => debug!("unhandled event 0x{:02x}", code),
                }
            }
        }
    }

    fn on_completion(&self, completion: Completion) {
        let opcode = completion.opcode();
        trace!(
            "completion for 0x{:04x}: status 0x{:02x}, {} credits",
            opcode,
            completion.status(),
            completion.credits()
        );

        // Match before returning the credit: a request still in `Reserved`
        // must not pick up the completion of an abandoned earlier command.
        let waiting = {
            let mut waiters = self.lock_waiters();
            match waiters.get_mut(&opcode) {
                Some(slot) if matches!(slot, Waiter::Sent) => {
                    *slot = Waiter::Done(completion.clone());
                    true
                }
                _ => false,
            }
        };

        // At most one command is outstanding, so any positive count
        // returns exactly the credit that command held.
        if completion.credits() > 0 {
            self.flow.release_command_credits(1);
        }

        if waiting {
            self.completed.notify_all();
        } else if opcode != 0 {
            let handler = self.completion_handler.read().unwrap_or_else(|e| e.into_inner());
            match handler.as_ref() {
                Some(handler) => handler(opcode, Ok(&completion)),
                None => debug!("unclaimed completion for opcode 0x{:04x}", opcode),
            }
        }

        self.drain_queue();
    }

    /// Send queued commands while credits last
    fn drain_queue(&self) {
        loop {
            let command = {
                let mut queue = self.lock_queue();
                if queue.is_empty() || !self.flow.commands().try_acquire() {
                    return;
                }
                match queue.pop_front() {
                    Some(command) => command,
                    None => return,
                }
            };

            if let Err(e) = self.transport.write(&command.to_packet()) {
                error!("failed to send queued command 0x{:04x}: {}", command.opcode(), e);
                self.flow.release_command_credits(1);
                let handler = self.completion_handler.read().unwrap_or_else(|e| e.into_inner());
                if let Some(handler) = handler.as_ref() {
                    handler(command.opcode(), Err(e));
                }
            }
        }
    }

    /// Queue a command without waiting for a credit
    ///
    /// Safe to call from the dispatch context. When a credit is available
    /// right away the command is written immediately and a transport error is
    /// returned to the caller; otherwise it goes out when a completion returns
    /// a credit, and its completion is delivered to the completion handler.
    pub fn queue_command(&self, command: HciCommand) -> Result<()> {
        {
            let mut queue = self.lock_queue();
            if !queue.is_empty() || !self.flow.commands().try_acquire() {
                trace!("queueing command 0x{:04x}", command.opcode());
                queue.push_back(command);
                return Ok(());
            }
        }

        self.write_command(&command)
    }

    fn write_command(&self, command: &HciCommand) -> Result<()> {
        trace!("sending command 0x{:04x}", command.opcode());
        self.transport.write(&command.to_packet()).map_err(|e| {
            self.flow.release_command_credits(1);
            e
        })
    }

    /// Send a command once a credit is available, without waiting for its completion
    ///
    /// Blocks; never call from the dispatch context.
    pub fn send_command(&self, command: &HciCommand, timeout: Option<Duration>) -> Result<()> {
        self.flow.acquire_command_credit(timeout, command.opcode())?;
        self.write_command(command)
    }

    /// Send a command and wait for its Command Complete or Command Status
    ///
    /// A non-success status is returned as [`HciError::CommandFailed`]. Only
    /// one request per opcode may be in flight. Blocks; never call from the
    /// dispatch context.
    pub fn command(&self, command: &HciCommand, timeout: Duration) -> Result<Completion> {
        let opcode = command.opcode();
        let deadline = Instant::now() + timeout;

        {
            let mut waiters = self.lock_waiters();
            if waiters.contains_key(&opcode) {
                return Err(HciError::Busy("command already in flight"));
            }
            waiters.insert(opcode, Waiter::Reserved);
        }

        if let Err(e) = self.flow.acquire_command_credit(Some(timeout), opcode) {
            self.lock_waiters().remove(&opcode);
            return Err(e);
        }

        let mut waiters = self.lock_waiters();
        waiters.insert(opcode, Waiter::Sent);
        if let Err(e) = self.write_command(command) {
            waiters.remove(&opcode);
            return Err(e);
        }

        loop {
            if matches!(waiters.get(&opcode), Some(Waiter::Done(_))) {
                if let Some(Waiter::Done(completion)) = waiters.remove(&opcode) {
                    return completion.into_result();
                }
            }

            let now = Instant::now();
            if now >= deadline {
                waiters.remove(&opcode);
                error!("command 0x{:04x} timed out", opcode);
                return Err(HciError::Timeout(opcode));
            }
            waiters = self
                .completed
                .wait_timeout(waiters, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Send ACL or ISO data on a registered connection
    ///
    /// Blocks until the connection's pool has a credit.
    pub fn send_data(&self, handle: u16, payload: Vec<u8>, timeout: Option<Duration>) -> Result<()> {
        let class = self.flow.acquire_data_credit(handle, timeout)?;
        let frame = match class {
            crate::flow::LinkClass::Acl => AclPacket::new(handle, payload).to_packet(),
            crate::flow::LinkClass::Iso => IsoPacket::new(handle, payload).to_packet(),
        };
        self.transport.write(&frame).map_err(|e| {
            self.flow.cancel_data_credit(handle);
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::LinkClass;
    use crate::transport::{ControllerEnd, MemoryTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn setup() -> (Arc<Dispatcher>, ControllerEnd) {
        let (transport, controller) = MemoryTransport::new();
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(transport), Arc::new(FlowControl::new())));
        (dispatcher, controller)
    }

    fn complete(opcode: u16, status: u8) -> Vec<u8> {
        let mut params = vec![1];
        params.extend_from_slice(&opcode.to_le_bytes());
        params.push(status);
        HciEvent::new(EVT_CMD_COMPLETE, params).to_packet()
    }

    #[test]
    fn test_command_round_trip() {
        let (dispatcher, controller) = setup();
        let responder = {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || {
                let frame = controller.recv_timeout(Duration::from_secs(5)).unwrap();
                assert_eq!(frame, HciCommand::Reset.to_packet());
                dispatcher.on_frame_received(&complete(OP_RESET, HCI_SUCCESS)).unwrap();
            })
        };

        let completion = dispatcher
            .command(&HciCommand::Reset, Duration::from_secs(5))
            .unwrap();
        responder.join().unwrap();
        assert_eq!(completion.opcode(), OP_RESET);
        assert_eq!(dispatcher.flow().commands().available(), 1);
    }

    #[test]
    fn test_command_failure_status() {
        let (dispatcher, controller) = setup();
        let responder = {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || {
                controller.recv_timeout(Duration::from_secs(5)).unwrap();
                let status = HciEvent::new(EVT_CMD_STATUS, vec![0x0C, 1, 0x03, 0x0C]).to_packet();
                dispatcher.on_frame_received(&status).unwrap();
            })
        };

        let err = dispatcher
            .command(&HciCommand::Reset, Duration::from_secs(5))
            .unwrap_err();
        responder.join().unwrap();
        assert!(matches!(
            err,
            HciError::CommandFailed { opcode: OP_RESET, status: 0x0C }
        ));
    }

    #[test]
    fn test_command_timeout_removes_waiter() {
        let (dispatcher, _controller) = setup();
        let err = dispatcher
            .command(&HciCommand::ReadBdAddr, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, HciError::Timeout(OP_READ_BD_ADDR)));

        // The late completion returns the credit and goes nowhere
        dispatcher
            .on_frame_received(&complete(OP_READ_BD_ADDR, HCI_SUCCESS))
            .unwrap();
        assert_eq!(dispatcher.flow().commands().available(), 1);
    }

    #[test]
    fn test_late_completion_is_not_taken_by_retry() {
        let (dispatcher, controller) = setup();
        let err = dispatcher
            .command(&HciCommand::ReadBdAddr, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, HciError::Timeout(OP_READ_BD_ADDR)));
        assert_eq!(controller.drain(), vec![HciCommand::ReadBdAddr.to_packet()]);

        let retry = {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || dispatcher.command(&HciCommand::ReadBdAddr, Duration::from_secs(5)))
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while dispatcher.flow().commands().waiters() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        // Completion of the abandoned command frees the credit only
        dispatcher
            .on_frame_received(&complete(OP_READ_BD_ADDR, 0x01))
            .unwrap();
        let frame = controller.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(frame, HciCommand::ReadBdAddr.to_packet());
        assert!(!retry.is_finished());

        dispatcher
            .on_frame_received(&complete(OP_READ_BD_ADDR, HCI_SUCCESS))
            .unwrap();
        let completion = retry.join().unwrap().unwrap();
        assert_eq!(completion.status(), HCI_SUCCESS);
    }

    #[test]
    fn test_queue_holds_commands_until_credit_returns() {
        let (dispatcher, controller) = setup();
        dispatcher.queue_command(HciCommand::Reset).unwrap();
        dispatcher.queue_command(HciCommand::ReadBdAddr).unwrap();
        assert_eq!(controller.drain(), vec![HciCommand::Reset.to_packet()]);

        dispatcher.on_frame_received(&complete(OP_RESET, HCI_SUCCESS)).unwrap();
        assert_eq!(controller.drain(), vec![HciCommand::ReadBdAddr.to_packet()]);
    }

    #[test]
    fn test_completion_handler_receives_unclaimed_completions() {
        let (dispatcher, _controller) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher.set_completion_handler(Box::new(move |opcode, result| {
            let status = result.map(|c| c.status()).unwrap_or(0xFF);
            sink.lock().unwrap().push((opcode, status));
        }));

        dispatcher.on_frame_received(&complete(OP_RESET, 0x01)).unwrap();
        // Opcode 0 only returns credits
        dispatcher.on_frame_received(&complete(0, HCI_SUCCESS)).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(OP_RESET, 0x01)]);
    }

    #[test]
    fn test_event_routing() {
        let (dispatcher, _controller) = setup();
        let hw_errors = Arc::new(AtomicUsize::new(0));
        let le_reports = Arc::new(AtomicUsize::new(0));

        let counter = hw_errors.clone();
        dispatcher.register_event_handler(
            EVT_HARDWARE_ERROR,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let counter = le_reports.clone();
        dispatcher.register_le_handler(
            EVT_LE_PER_ADV_SYNC_LOST,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        dispatcher
            .on_frame_received(&HciEvent::new(EVT_HARDWARE_ERROR, vec![0x01]).to_packet())
            .unwrap();
        dispatcher
            .on_frame_received(&HciEvent::new(EVT_LE_META_EVENT, vec![EVT_LE_PER_ADV_SYNC_LOST, 1, 0]).to_packet())
            .unwrap();
        // Unknown codes are dropped quietly
        dispatcher
            .on_frame_received(&HciEvent::new(0x30, vec![]).to_packet())
            .unwrap();

        assert_eq!(hw_errors.load(Ordering::SeqCst), 1);
        assert_eq!(le_reports.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_length_mismatch_is_dropped() {
        let (dispatcher, _controller) = setup();
        let err = dispatcher
            .on_frame_received(&[HCI_EVENT_PKT, EVT_HARDWARE_ERROR, 4, 0x01])
            .unwrap_err();
        assert!(matches!(err, HciError::LengthMismatch { declared: 4, available: 1 }));
        assert!(err.is_protocol());

        // Still usable afterwards
        dispatcher.queue_command(HciCommand::Reset).unwrap();
    }

    #[test]
    fn test_data_path() {
        let (dispatcher, controller) = setup();
        dispatcher.flow().pool(LinkClass::Acl).reset(1);
        dispatcher.flow().register_link(0x0042, LinkClass::Acl);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        dispatcher.register_data_handler(
            0x0042,
            Box::new(move |packet| {
                if let HciPacket::Acl(acl) = packet {
                    sink.lock().unwrap().push(acl.data.clone());
                }
            }),
        );

        dispatcher.send_data(0x0042, vec![1, 2, 3], None).unwrap();
        assert_eq!(
            controller.drain(),
            vec![AclPacket::new(0x0042, vec![1, 2, 3]).to_packet()]
        );
        assert!(dispatcher
            .send_data(0x0042, vec![4], Some(Duration::from_millis(10)))
            .is_err());

        let ncp = HciEvent::new(EVT_NUM_COMPLETED_PACKETS, vec![1, 0x42, 0x00, 1, 0]).to_packet();
        dispatcher.on_frame_received(&ncp).unwrap();
        assert_eq!(dispatcher.flow().pool(LinkClass::Acl).available(), 1);

        dispatcher
            .on_frame_received(&AclPacket::new(0x0042, vec![9, 9]).to_packet())
            .unwrap();
        assert_eq!(*received.lock().unwrap(), vec![vec![9, 9]]);
    }
}
