use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devlink_core::config::ConfigBuilder;
use devlink_core::logging;
use devlink_devices::device::Result;
use devlink_devices::prelude::CancellationToken;
use devlink_devices::protocols::{Line, LineCommand};
use devlink_devices::{
    simulated, AddressPair, BufferedTransport, Device, DeviceState, Dispatcher, DispatcherConfig,
    PortName, ScanResult, Scanner, SharedConnectionRegistry, UsbId, Watcher, WatcherConfig,
};
use tokio::sync::watch;
use tracing::info;

/// Reports the simulated board as plugged in while the flag is set
struct ToggleScanner {
    present: watch::Receiver<bool>,
}

#[async_trait]
impl Scanner for ToggleScanner {
    type Hardware = UsbId;
    type Software = PortName;

    async fn scan(&self, _cancel: &CancellationToken) -> Result<ScanResult<UsbId, PortName>> {
        if *self.present.borrow() {
            Ok(ScanResult::from_pairs([AddressPair::new(
                UsbId::new(0x2341, 0x0043),
                PortName::new("/dev/ttyACM0"),
            )]))
        } else {
            Ok(ScanResult::empty())
        }
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // Load configuration and initialize the logger
    let config = ConfigBuilder::new().with_environment_prefix("DEVLINK").build()?;
    logging::init_from_config(&config.logging)?;

    // Simulated board that answers a couple of line commands
    let (link, board) = simulated("/dev/ttyACM0");
    board.set_responder(|request| match request {
        b"*IDN?\n" => Some(b"\x00UNO SIM,1.0\r\n".to_vec()),
        b"TEMP?\n" => Some(b"21.5\r\n".to_vec()),
        _ => Some(b"ERR\r\n".to_vec()),
    });

    let registry = SharedConnectionRegistry::new();
    let transport = Arc::new(BufferedTransport::with_registry(link, registry.clone()));
    let dispatcher = Dispatcher::with_config(transport, DispatcherConfig::from(&config.transport));
    let device = Arc::new(Device::with_dispatcher(UsbId::new(0x2341, 0x0043), dispatcher));

    // Watch for the board and let the device follow it
    let (plug, present) = watch::channel(false);
    let watcher = Watcher::new(
        ToggleScanner { present },
        WatcherConfig::from(&config.watcher),
    );
    let cancel = CancellationToken::new();
    let follower = device.clone().follow(watcher.subscribe(), cancel.clone());
    watcher.start();

    info!("Plugging in the board");
    plug.send(true)?;
    while device.state() != DeviceState::Connected {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let command = LineCommand::new();
    for request in ["*IDN?", "TEMP?", "HELLO"] {
        let reply = device
            .dispatcher()
            .exchange_timeout(&command, &Line::try_new(request)?)
            .await?;
        info!("{} -> {}", request, reply);
    }
    info!("Registry holds {:?}", registry.registry().addresses());

    info!("Unplugging the board");
    plug.send(false)?;
    board.unplug();
    tokio::time::sleep(config.watcher.scan_interval() * 2).await;
    info!("Device state: {:?}", device.state());

    watcher.stop().await?;
    cancel.cancel();
    follower.await?;

    Ok(())
}
