use bluehci::gap::ADV_TYPE_FLAGS;
use bluehci::{AdvOptions, AdvParams, HciSocket, Host, HostConfig, HostEvent, MemoryStore};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let socket = HciSocket::open(0)?;
    let host = Host::new(HostConfig::default(), Arc::new(socket), Arc::new(MemoryStore::new()))?;
    host.set_event_callback(Arc::new(Mutex::new(|event: &HostEvent| match event {
        HostEvent::Connected { handle, peer, adv_handle, .. } => {
            println!("connection 0x{:04x} from {} via set {:?}", handle, peer, adv_handle);
        }
        HostEvent::Disconnected { handle, reason } => {
            println!("connection 0x{:04x} closed (0x{:02x})", handle, reason);
        }
        other => println!("event: {:?}", other),
    })));
    host.spawn_reader()?;
    host.enable_blocking(Duration::from_secs(10))?;
    host.set_name("bluehci-demo")?;

    let adv = host.advertising();
    let handle = adv.create()?;
    adv.set_params(
        handle,
        AdvParams::new(AdvOptions::CONNECTABLE | AdvOptions::USE_NAME | AdvOptions::PERSIST),
    )?;
    // LE General Discoverable, BR/EDR not supported
    adv.set_data(handle, &[(ADV_TYPE_FLAGS, vec![0x06])], &[])?;
    adv.start(handle, 0, 0)?;
    println!("Advertising on set {}, press Enter to stop", handle);

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    adv.delete(handle)?;
    host.shutdown();
    Ok(())
}
