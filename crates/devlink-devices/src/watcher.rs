/*!
 * Device watcher.
 *
 * The watcher polls a [`Scanner`], diffs each result against the devices it
 * already knows and broadcasts [`WatcherEvent`]s for devices that appeared
 * or disappeared. State is updated before the matching event is sent, so a
 * device is never reported added twice without a removal in between.
 */
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use devlink_core::config::WatcherSettings;
use devlink_core::logging::component_span;

use crate::address::{Address, AddressPair};
use crate::device::{DeviceError, Result};
use crate::discovery::Scanner;

/// Watcher settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Pause between two scans
    pub scan_interval: Duration,
    /// End the poll loop on the first scan error instead of logging it
    pub strict: bool,
    /// Events buffered per subscriber before it starts lagging
    pub channel_capacity: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_millis(500),
            strict: false,
            channel_capacity: 100,
        }
    }
}

impl From<&WatcherSettings> for WatcherConfig {
    fn from(settings: &WatcherSettings) -> Self {
        Self {
            scan_interval: settings.scan_interval(),
            strict: settings.strict,
            ..Self::default()
        }
    }
}

/// A device appeared or disappeared
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatcherEvent<H, S> {
    /// The device is newly reachable
    Added {
        /// Both identities of the device
        device: AddressPair<H, S>,
        /// When the watcher noticed
        at: DateTime<Utc>,
    },
    /// The device is no longer reachable
    Removed {
        /// Both identities the device had
        device: AddressPair<H, S>,
        /// When the watcher noticed
        at: DateTime<Utc>,
    },
}

impl<H: Address, S: Address> WatcherEvent<H, S> {
    /// An added event stamped now
    pub fn added(device: AddressPair<H, S>) -> Self {
        WatcherEvent::Added {
            device,
            at: Utc::now(),
        }
    }

    /// A removed event stamped now
    pub fn removed(device: AddressPair<H, S>) -> Self {
        WatcherEvent::Removed {
            device,
            at: Utc::now(),
        }
    }

    /// The device the event is about
    pub fn pair(&self) -> &AddressPair<H, S> {
        match self {
            WatcherEvent::Added { device, .. } | WatcherEvent::Removed { device, .. } => device,
        }
    }

    /// When the event was observed
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            WatcherEvent::Added { at, .. } | WatcherEvent::Removed { at, .. } => *at,
        }
    }

    /// Whether this is an added event
    pub fn is_added(&self) -> bool {
        matches!(self, WatcherEvent::Added { .. })
    }
}

/// Known devices as two index-aligned lists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherState<H, S> {
    hardware: Vec<H>,
    software: Vec<S>,
}

impl<H, S> Default for WatcherState<H, S> {
    fn default() -> Self {
        Self {
            hardware: Vec::new(),
            software: Vec::new(),
        }
    }
}

impl<H: Address, S: Address> WatcherState<H, S> {
    /// Known hardware addresses in discovery order
    pub fn hardware(&self) -> &[H] {
        &self.hardware
    }

    /// Software addresses aligned with [`hardware`](Self::hardware)
    pub fn software(&self) -> &[S] {
        &self.software
    }

    /// Number of known devices
    pub fn len(&self) -> usize {
        self.hardware.len()
    }

    /// Whether no device is known
    pub fn is_empty(&self) -> bool {
        self.hardware.is_empty()
    }

    /// Known devices as pairs
    pub fn pairs(&self) -> Vec<AddressPair<H, S>> {
        self.hardware
            .iter()
            .cloned()
            .zip(self.software.iter().cloned())
            .map(|(hardware, software)| AddressPair::new(hardware, software))
            .collect()
    }
}

type Event<Sc> = WatcherEvent<<Sc as Scanner>::Hardware, <Sc as Scanner>::Software>;
type State<Sc> = WatcherState<<Sc as Scanner>::Hardware, <Sc as Scanner>::Software>;

struct Core<Sc: Scanner> {
    scanner: Sc,
    config: WatcherConfig,
    state: RwLock<State<Sc>>,
    event_sender: broadcast::Sender<Event<Sc>>,
}

impl<Sc: Scanner> Core<Sc> {
    fn read(&self) -> RwLockReadGuard<'_, State<Sc>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State<Sc>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: Event<Sc>) {
        // No subscribers is fine.
        let _ = self.event_sender.send(event);
    }

    async fn poll_once(&self, cancel: &CancellationToken) -> Result<()> {
        let scan = AssertUnwindSafe(self.scanner.scan(cancel))
            .catch_unwind()
            .await
            .map_err(|_| DeviceError::ScanFailed("scanner panicked".to_string()))??;
        let (hardware_now, software_now) = scan.into_parts();

        // A hardware address reported twice in one scan keeps its first
        // software address.
        let mut present = HashSet::with_capacity(hardware_now.len());
        let mut current = Vec::with_capacity(hardware_now.len());
        for (hardware, software) in hardware_now.into_iter().zip(software_now) {
            if present.insert(hardware.clone()) {
                current.push((hardware, software));
            } else {
                debug!("Ignoring duplicate {} at {} in scan", hardware, software);
            }
        }

        // Both passes run under one guard so concurrent polls never
        // interleave their diffs.
        let mut state = self.write();

        for index in (0..state.len()).rev() {
            if present.contains(&state.hardware[index]) {
                continue;
            }
            let hardware = state.hardware.remove(index);
            let software = state.software.remove(index);
            let device = AddressPair::new(hardware, software);
            info!("Device removed: {}", device);
            self.emit(WatcherEvent::removed(device));
        }

        for (hardware, software) in current {
            match state.hardware.iter().position(|known| *known == hardware) {
                Some(index) => {
                    if state.software[index] != software {
                        debug!(
                            "Device {} moved from {} to {}",
                            hardware, state.software[index], software
                        );
                        state.software[index] = software;
                    }
                }
                None => {
                    state.hardware.push(hardware.clone());
                    state.software.push(software.clone());
                    let device = AddressPair::new(hardware, software);
                    info!("Device added: {}", device);
                    self.emit(WatcherEvent::added(device));
                }
            }
        }

        Ok(())
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        info!("Watcher started, scanning every {:?}", self.config.scan_interval);
        loop {
            if let Err(e) = self.poll_once(&cancel).await {
                if cancel.is_cancelled() {
                    break;
                }
                if self.config.strict {
                    error!("Scan failed, stopping watcher: {}", e);
                    return Err(e);
                }
                warn!("Scan failed: {}", e);
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.scan_interval) => {}
            }
        }
        info!("Watcher stopped");
        Ok(())
    }
}

struct PollTask {
    cancel: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

/// Background poller that turns scans into add/remove events
pub struct Watcher<Sc: Scanner> {
    core: Arc<Core<Sc>>,
    task: Mutex<Option<PollTask>>,
}

impl<Sc: Scanner> fmt::Debug for Watcher<Sc> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("config", &self.core.config)
            .field("known", &self.core.read().len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl<Sc: Scanner> Watcher<Sc> {
    /// Create a stopped watcher
    pub fn new(scanner: Sc, config: WatcherConfig) -> Self {
        let (event_sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            core: Arc::new(Core {
                scanner,
                config,
                state: RwLock::new(WatcherState::default()),
                event_sender,
            }),
            task: Mutex::new(None),
        }
    }

    /// The watcher settings
    pub fn config(&self) -> &WatcherConfig {
        &self.core.config
    }

    /// The scanner being polled
    pub fn scanner(&self) -> &Sc {
        &self.core.scanner
    }

    /// Subscribe to add/remove events
    pub fn subscribe(&self) -> broadcast::Receiver<Event<Sc>> {
        self.core.event_sender.subscribe()
    }

    fn task(&self) -> std::sync::MutexGuard<'_, Option<PollTask>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the poll loop is running
    pub fn is_running(&self) -> bool {
        self.task()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Start polling. Returns `false` if the watcher was already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut task = self.task();
        if task.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            debug!("Watcher already running");
            return false;
        }
        if task.take().is_some() {
            debug!("Replacing finished poll task");
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            self.core
                .clone()
                .run(cancel.clone())
                .instrument(component_span("watcher", None)),
        );
        *task = Some(PollTask { cancel, handle });
        true
    }

    /// Stop polling and wait for the poll loop to finish. A no-op when not
    /// running. In strict mode the scan error that ended the loop is
    /// returned here.
    pub async fn stop(&self) -> Result<()> {
        let task = self.task().take();
        let Some(task) = task else {
            return Ok(());
        };
        task.cancel.cancel();
        match task.handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                Err(DeviceError::ScanFailed("poll task panicked".to_string()))
            }
            Err(_) => Ok(()),
        }
    }

    /// Run one scan-and-diff iteration on the calling task
    pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<()> {
        self.core.poll_once(cancel).await
    }

    /// Copy of the known devices
    pub fn snapshot(&self) -> State<Sc> {
        self.core.read().clone()
    }

    /// Software address of a known device. When both address types are the
    /// same type, the address maps to itself.
    pub fn hardware_to_software(&self, hardware: &Sc::Hardware) -> Option<Sc::Software> {
        if let Some(same) = (hardware as &dyn Any).downcast_ref::<Sc::Software>() {
            return Some(same.clone());
        }
        let state = self.core.read();
        state
            .hardware
            .iter()
            .position(|known| known == hardware)
            .map(|index| state.software[index].clone())
    }

    /// Hardware address of a known device. When both address types are the
    /// same type, the address maps to itself.
    pub fn software_to_hardware(&self, software: &Sc::Software) -> Option<Sc::Hardware> {
        if let Some(same) = (software as &dyn Any).downcast_ref::<Sc::Hardware>() {
            return Some(same.clone());
        }
        let state = self.core.read();
        state
            .software
            .iter()
            .position(|known| known == software)
            .map(|index| state.hardware[index].clone())
    }
}

impl<Sc: Scanner> Drop for Watcher<Sc> {
    fn drop(&mut self) {
        if let Some(task) = self.task().take() {
            task.cancel.cancel();
        }
    }
}
