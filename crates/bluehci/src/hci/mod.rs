//! Bluetooth HCI (Host Controller Interface) implementation
//!
//! Packet codecs, typed events, H4 framing and the frame dispatcher.

pub mod constants;
pub mod dispatch;
pub mod events;
pub mod framer;
pub mod packet;

#[cfg(test)]
mod tests;

pub use dispatch::{Completion, Dispatcher};
pub use framer::H4Decoder;
pub use packet::{HciCommand, HciEvent, HciPacket, LeAdvertisingReport, LeExtAdvertisingReport};
