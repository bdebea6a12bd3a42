//! Watcher diffing and device following with a scripted scanner.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use devlink_devices::device::Result;
use devlink_devices::prelude::CancellationToken;
use devlink_devices::{
    simulated, AddressPair, BufferedTransport, Device, DeviceState, ScanResult, Scanner, Watcher,
    WatcherConfig, WatcherEvent,
};
use tokio::sync::broadcast::Receiver;

/// Scanner that replays a fixed list of hardware sets, then keeps
/// returning the last one. Software addresses are derived from hardware.
struct Scripted {
    scans: Mutex<VecDeque<Vec<&'static str>>>,
    last: Mutex<Vec<&'static str>>,
}

impl Scripted {
    fn new(scans: Vec<Vec<&'static str>>) -> Self {
        Self {
            scans: Mutex::new(scans.into()),
            last: Mutex::new(Vec::new()),
        }
    }
}

fn port_of(hardware: &str) -> String {
    format!("/dev/tty{}", hardware)
}

#[async_trait]
impl Scanner for Scripted {
    type Hardware = String;
    type Software = String;

    async fn scan(&self, _cancel: &CancellationToken) -> Result<ScanResult<String, String>> {
        let next = self.scans.lock().unwrap().pop_front();
        let hardware = match next {
            Some(hardware) => {
                *self.last.lock().unwrap() = hardware.clone();
                hardware
            }
            None => self.last.lock().unwrap().clone(),
        };
        ScanResult::new(
            hardware.iter().map(|h| h.to_string()).collect(),
            hardware.iter().map(|h| port_of(h)).collect(),
        )
    }
}

fn describe(event: &WatcherEvent<String, String>) -> String {
    let kind = if event.is_added() { "add" } else { "remove" };
    format!("{}({})", kind, event.pair().hardware)
}

fn drain(events: &mut Receiver<WatcherEvent<String, String>>) -> Vec<String> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(describe(&event));
    }
    seen
}

#[tokio::test]
async fn replaced_device_yields_remove_then_add() {
    let watcher = Watcher::new(
        Scripted::new(vec![vec!["A", "B"], vec!["B", "C"]]),
        WatcherConfig::default(),
    );
    let mut events = watcher.subscribe();
    let cancel = CancellationToken::new();

    watcher.poll_once(&cancel).await.unwrap();
    assert_eq!(drain(&mut events), ["add(A)", "add(B)"]);

    watcher.poll_once(&cancel).await.unwrap();
    assert_eq!(drain(&mut events), ["remove(A)", "add(C)"]);

    let state = watcher.snapshot();
    assert_eq!(state.hardware(), &["B".to_string(), "C".to_string()]);
    assert_eq!(state.software(), &[port_of("B"), port_of("C")]);
}

#[tokio::test]
async fn events_match_set_differences() {
    let script: Vec<Vec<&'static str>> = vec![
        vec![],
        vec!["A"],
        vec!["A", "B", "C"],
        vec!["C"],
        vec!["D", "C", "A"],
        vec![],
        vec!["B"],
    ];
    let watcher = Watcher::new(Scripted::new(script.clone()), WatcherConfig::default());
    let mut events = watcher.subscribe();
    let cancel = CancellationToken::new();

    let mut previous: HashSet<&str> = HashSet::new();
    for scan in &script {
        watcher.poll_once(&cancel).await.unwrap();
        let current: HashSet<&str> = scan.iter().copied().collect();

        let mut removed = HashSet::new();
        let mut added = HashSet::new();
        while let Ok(event) = events.try_recv() {
            let hardware = event.pair().hardware.clone();
            assert_eq!(event.pair().software, port_of(&hardware));
            if event.is_added() {
                assert!(added.insert(hardware));
            } else {
                assert!(removed.insert(hardware));
            }
        }

        let expected_added: HashSet<String> =
            current.difference(&previous).map(|h| h.to_string()).collect();
        let expected_removed: HashSet<String> =
            previous.difference(&current).map(|h| h.to_string()).collect();
        assert_eq!(added, expected_added);
        assert_eq!(removed, expected_removed);

        let state = watcher.snapshot();
        let known: HashSet<&str> = state.hardware().iter().map(String::as_str).collect();
        assert_eq!(known, current);
        assert_eq!(state.hardware().len(), state.software().len());

        previous = current;
    }
}

#[tokio::test]
async fn lookups_follow_state() {
    let watcher = Watcher::new(
        Scripted::new(vec![vec!["A", "B"], vec!["B"]]),
        WatcherConfig::default(),
    );
    let cancel = CancellationToken::new();

    watcher.poll_once(&cancel).await.unwrap();
    watcher.poll_once(&cancel).await.unwrap();

    // Same address type on both sides maps to itself.
    assert_eq!(watcher.hardware_to_software(&"A".to_string()), Some("A".to_string()));
    assert_eq!(watcher.snapshot().pairs(), [AddressPair::new("B".to_string(), port_of("B"))]);
}

#[tokio::test(start_paused = true)]
async fn device_follows_watcher() {
    let watcher = Watcher::new(
        Scripted::new(vec![vec![], vec!["A"], vec!["A"], vec![]]),
        WatcherConfig {
            scan_interval: Duration::from_millis(100),
            ..WatcherConfig::default()
        },
    );

    let (link, sim) = simulated(port_of("A"));
    let device = Arc::new(Device::new(
        "A".to_string(),
        Arc::new(BufferedTransport::new(link)),
    ));
    let follow_cancel = CancellationToken::new();
    let follower = device
        .clone()
        .follow(watcher.subscribe(), follow_cancel.clone());

    watcher.start();
    assert!(watcher.is_running());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(device.state(), DeviceState::Connected);
    assert_eq!(sim.open_count(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(device.state(), DeviceState::Disconnected);
    assert_eq!(sim.open_count(), 1);

    watcher.stop().await.unwrap();
    follow_cancel.cancel();
    follower.await.unwrap();
}
