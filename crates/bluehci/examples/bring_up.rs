use bluehci::{FileStore, H4Transport, HciSocket, Host, HostConfig, HostEvent, Transport};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Optional config file as the first argument
    let config = match std::env::args().nth(1) {
        Some(path) => HostConfig::load(path)?,
        None => HostConfig::default(),
    };

    // A serial controller instead of hci0 when BLUEHCI_H4_DEVICE names its tty
    let transport: Arc<dyn Transport> = match std::env::var("BLUEHCI_H4_DEVICE") {
        Ok(path) => Arc::new(H4Transport::open_device(path, &config)?),
        Err(_) => match HciSocket::open(0) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                eprintln!("Failed to open HCI socket: {}", e);
                eprintln!("The adapter must exist and be down, and raw sockets need CAP_NET_RAW");
                return Err(e.into());
            }
        },
    };
    let store = FileStore::open(std::env::temp_dir().join("bluehci-settings"))?;

    let host = Host::new(config, transport, Arc::new(store))?;
    host.set_event_callback(Arc::new(Mutex::new(|event: &HostEvent| {
        println!("event: {:?}", event);
    })));
    host.spawn_reader()?;
    host.enable_blocking(Duration::from_secs(10))?;

    let info = host.device().controller_info()?;
    println!("HCI version {} revision 0x{:04x}", info.hci_version, info.hci_revision);
    println!("manufacturer 0x{:04x}", info.manufacturer);
    for (id, addr) in host.device().identities().iter().enumerate() {
        println!("identity {}: {}", id, addr);
    }

    host.shutdown();
    Ok(())
}
