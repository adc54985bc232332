//! Controller transports
//!
//! A transport moves complete HCI frames (`[type][header][payload]`) between
//! the host and the controller. The host only ever sees whole frames; the
//! byte stream transport [`H4Transport`] runs its input through
//! [`H4Decoder`](crate::hci::framer::H4Decoder) first.

pub mod socket;
pub mod uart;

use crate::error::{HciError, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Mutex;
use std::time::Duration;

pub use socket::HciSocket;
pub use uart::H4Transport;

/// Frame level access to a controller
pub trait Transport: Send + Sync {
    /// Prepare the transport for traffic
    fn open(&self) -> Result<()> {
        Ok(())
    }

    /// Write one complete frame
    fn write(&self, frame: &[u8]) -> Result<()>;

    /// Read one complete frame
    ///
    /// Returns `Ok(None)` when `timeout` elapsed without traffic.
    fn read(&self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>>;
}

/// In-process transport backed by channels
///
/// The other half, [`ControllerEnd`], plays the controller: it sees every
/// frame the host writes and can push frames toward the host.
#[derive(Debug)]
pub struct MemoryTransport {
    to_controller: Mutex<Sender<Vec<u8>>>,
    from_controller: Mutex<Receiver<Vec<u8>>>,
}

/// Controller side of a [`MemoryTransport`]
#[derive(Debug)]
pub struct ControllerEnd {
    from_host: Receiver<Vec<u8>>,
    to_host: Sender<Vec<u8>>,
}

impl MemoryTransport {
    pub fn new() -> (Self, ControllerEnd) {
        let (host_tx, controller_rx) = mpsc::channel();
        let (controller_tx, host_rx) = mpsc::channel();
        (
            Self {
                to_controller: Mutex::new(host_tx),
                from_controller: Mutex::new(host_rx),
            },
            ControllerEnd {
                from_host: controller_rx,
                to_host: controller_tx,
            },
        )
    }
}

impl Transport for MemoryTransport {
    fn write(&self, frame: &[u8]) -> Result<()> {
        let tx = self.to_controller.lock().unwrap_or_else(|e| e.into_inner());
        tx.send(frame.to_vec()).map_err(|_| HciError::TransportClosed)
    }

    fn read(&self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
        let rx = self.from_controller.lock().unwrap_or_else(|e| e.into_inner());
        match timeout {
            None => rx.recv().map(Some).map_err(|_| HciError::TransportClosed),
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(frame) => Ok(Some(frame)),
                Err(RecvTimeoutError::Timeout) => Ok(None),
                Err(RecvTimeoutError::Disconnected) => Err(HciError::TransportClosed),
            },
        }
    }
}

impl ControllerEnd {
    /// Next frame written by the host, if any
    pub fn try_recv(&self) -> Option<Vec<u8>> {
        match self.from_host.try_recv() {
            Ok(frame) => Some(frame),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.from_host.recv_timeout(timeout).ok()
    }

    /// Every frame written by the host so far
    pub fn drain(&self) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Push a frame toward the host
    pub fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.to_host.send(frame).map_err(|_| HciError::TransportClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_transport_both_directions() {
        let (transport, controller) = MemoryTransport::new();
        transport.open().unwrap();

        transport.write(&[0x01, 0x03, 0x0C, 0x00]).unwrap();
        assert_eq!(controller.drain(), vec![vec![0x01, 0x03, 0x0C, 0x00]]);
        assert!(controller.try_recv().is_none());

        assert_eq!(transport.read(Some(Duration::from_millis(1))).unwrap(), None);
        controller.send(vec![0x04, 0x10, 0x01, 0x00]).unwrap();
        assert_eq!(
            transport.read(Some(Duration::from_secs(1))).unwrap(),
            Some(vec![0x04, 0x10, 0x01, 0x00])
        );
    }

    #[test]
    fn test_closed_controller_end() {
        let (transport, controller) = MemoryTransport::new();
        drop(controller);
        assert!(matches!(transport.write(&[0x01]), Err(HciError::TransportClosed)));
        assert!(matches!(transport.read(None), Err(HciError::TransportClosed)));
    }
}
