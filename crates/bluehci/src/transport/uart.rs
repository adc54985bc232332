//! H4 byte stream transport
//!
//! Serial attached controllers (a tty, a pty from an emulator, a socket to
//! a virtual controller) deliver packets back to back with a one-byte type
//! indicator in front. A reader thread runs the incoming bytes through an
//! [`H4Decoder`] and hands complete frames to [`Transport::read`].

use crate::config::HostConfig;
use crate::error::{HciError, Result};
use crate::hci::framer::H4Decoder;
use crate::transport::Transport;
use log::{debug, error, trace, warn};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

const READ_CHUNK: usize = 1024;

/// Transport over any H4 framed byte stream
pub struct H4Transport {
    writer: Mutex<Box<dyn Write + Send>>,
    frames: Mutex<Receiver<Vec<u8>>>,
}

impl std::fmt::Debug for H4Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H4Transport").finish_non_exhaustive()
    }
}

impl H4Transport {
    /// Wrap the two halves of a byte stream
    ///
    /// Frames longer than `max_frame_len` are treated as framing errors.
    pub fn new<R, W>(reader: R, writer: W, max_frame_len: usize) -> Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("bluehci-h4".into())
            .spawn(move || pump(reader, H4Decoder::new(max_frame_len), tx))
            .map_err(HciError::SocketError)?;

        Ok(Self {
            writer: Mutex::new(Box::new(writer)),
            frames: Mutex::new(rx),
        })
    }

    /// Open a serial device node, already configured for the controller's line settings
    pub fn open_device<P: AsRef<Path>>(path: P, config: &HostConfig) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(HciError::SocketError)?;
        let reader = file.try_clone().map_err(HciError::SocketError)?;
        debug!("opened H4 device {}", path.as_ref().display());
        Self::new(reader, file, config.max_frame_len)
    }
}

fn pump<R: Read>(mut reader: R, mut decoder: H4Decoder, frames: Sender<Vec<u8>>) {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => {
                debug!("H4 stream closed");
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("H4 read failed: {}", e);
                return;
            }
        };
        decoder.feed(&chunk[..n]);

        while let Some(next) = decoder.next_frame() {
            match next {
                Ok(frame) => {
                    trace!("H4 frame of {} bytes", frame.len());
                    if frames.send(frame).is_err() {
                        return;
                    }
                }
                Err(e) => warn!("H4 framing error: {}", e),
            }
        }
    }
}

impl Transport for H4Transport {
    fn write(&self, frame: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer
            .write_all(frame)
            .and_then(|_| writer.flush())
            .map_err(HciError::SendError)
    }

    fn read(&self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
        let rx = self.frames.lock().unwrap_or_else(|e| e.into_inner());
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
