//! bluehci - Bluetooth HCI host core
//!
//! This library takes a Bluetooth controller from power-on to a ready,
//! flow-controlled state and keeps the host's view of it consistent:
//! identities, extended advertising sets, periodic advertising syncs,
//! scanning and connections. Frames reach the controller through a
//! [`Transport`]; the Linux raw HCI socket, an H4 byte stream and an
//! in-memory channel pair are provided.
//!
//! [`Host`] wires everything together. The components can also be used on
//! their own over a shared [`Dispatcher`] and [`DeviceState`].

pub mod adv;
pub mod bringup;
pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod flags;
pub mod flow;
pub mod gap;
pub mod hci;
pub mod host;
pub mod periodic;
pub mod scan;
pub mod settings;
pub mod transport;
pub mod work;

#[cfg(test)]
pub(crate) mod testing;

// Re-export common types for convenience
pub use adv::{AdvFlags, AdvOptions, AdvParams, Advertising};
pub use bringup::{BringUp, BringUpState, ChipsetDriver};
pub use config::HostConfig;
pub use device::{DevFlags, DeviceState};
pub use error::{HciError, Result};
pub use event::{AdvertisingReport, EventSink, HostEvent, PairingHandler};
pub use flow::{FlowControl, LinkClass};
pub use gap::{AddressType, BdAddr, LeAddr, Role};
pub use hci::{Dispatcher, HciCommand, HciEvent, HciPacket};
pub use host::Host;
pub use periodic::{PeriodicSyncs, SyncFlags, SyncParams};
pub use scan::{parse_advertising_data, Scanner};
pub use settings::{FileStore, IdentityStore, MemoryStore, SettingsStore};
pub use transport::{H4Transport, HciSocket, MemoryTransport, Transport};
