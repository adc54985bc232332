use bluehci::gap::ADV_TYPE_COMPLETE_LOCAL_NAME;
use bluehci::{HciSocket, Host, HostConfig, HostEvent, MemoryStore};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let socket = HciSocket::open(0)?;
    let host = Host::new(HostConfig::default(), Arc::new(socket), Arc::new(MemoryStore::new()))?;
    host.set_event_callback(Arc::new(Mutex::new(|event: &HostEvent| {
        if let HostEvent::AdvertisingReport(report) = event {
            let name = report
                .data
                .iter()
                .find(|(ad_type, _)| *ad_type == ADV_TYPE_COMPLETE_LOCAL_NAME)
                .map(|(_, name)| String::from_utf8_lossy(name).into_owned());
            println!("{} rssi {} name {:?}", report.address, report.rssi, name);
        }
    })));
    host.spawn_reader()?;
    host.enable_blocking(Duration::from_secs(10))?;

    host.scanner().start(true, true)?;
    println!("Scanning for 10 seconds...");
    thread::sleep(Duration::from_secs(10));
    host.scanner().stop()?;

    host.shutdown();
    Ok(())
}
