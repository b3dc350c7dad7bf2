//! Process-wide device enumeration on a background thread.

use crate::error::Result;
use libsane::{Backend, DeviceInfo, SaneError};
use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct DiscoveryState {
    devices: Vec<DeviceInfo>,
    /// Completed enumerations.
    generation: u64,
    /// A refresh was requested and has not started yet.
    pending: bool,
    enumerating: bool,
    last_error: Option<SaneError>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<DiscoveryState>,
    changed: Condvar,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Vec<DeviceInfo>>>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, DiscoveryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Enumerates devices for every session of the process. At most one
/// enumeration runs at a time; refresh requests arriving meanwhile are
/// coalesced into one follow-up run.
pub struct DeviceDiscovery {
    shared: Arc<Shared>,
    requests: Option<mpsc::UnboundedSender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceDiscovery {
    pub fn new(backend: Arc<dyn Backend>) -> Result<Arc<Self>> {
        let shared = Arc::new(Shared::default());
        let (requests_tx, mut requests_rx) = mpsc::unbounded_channel::<()>();

        let thread = thread::Builder::new().name("discovery".to_owned()).spawn({
            let shared = shared.clone();
            move || {
                while requests_rx.blocking_recv().is_some() {
                    while requests_rx.try_recv().is_ok() {}
                    enumerate(backend.as_ref(), &shared);
                }
                log::debug!("Device discovery stopped");
            }
        })?;

        Ok(Arc::new(Self {
            shared,
            requests: Some(requests_tx),
            thread: Some(thread),
        }))
    }

    /// Schedules an enumeration unless one is already waiting to start.
    pub fn refresh(&self) {
        let mut state = self.shared.state();
        if state.pending {
            return;
        }

        let Some(requests) = &self.requests else {
            return;
        };
        if requests.send(()).is_ok() {
            state.pending = true;
        }
    }

    /// The last enumeration result, possibly empty if none completed yet.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.shared.state().devices.clone()
    }

    /// Blocks until no enumeration is outstanding, starting one if the
    /// list was never read.
    pub fn wait(&self) -> Vec<DeviceInfo> {
        if self.generation() == 0 {
            self.refresh();
        }

        let state = self.shared.state();
        let state = self
            .shared
            .changed
            .wait_while(state, |state| state.pending || state.enumerating)
            .unwrap_or_else(PoisonError::into_inner);

        state.devices.clone()
    }

    pub fn find(&self, name: &str) -> Option<DeviceInfo> {
        self.shared
            .state()
            .devices
            .iter()
            .find(|device| device.name == name)
            .cloned()
    }

    pub fn generation(&self) -> u64 {
        self.shared.state().generation
    }

    pub fn last_error(&self) -> Option<SaneError> {
        self.shared.state().last_error
    }

    /// Receives every completed enumeration from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<DeviceInfo>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Picks a device name. A single device is taken without asking,
    /// otherwise `chooser` decides.
    pub fn select_device<F>(&self, chooser: F) -> Option<String>
    where
        F: FnOnce(&[DeviceInfo]) -> Option<String>,
    {
        let devices = self.wait();
        match devices.as_slice() {
            [] => None,
            [device] => Some(device.name.to_string()),
            devices => chooser(devices),
        }
    }
}

impl Drop for DeviceDiscovery {
    fn drop(&mut self) {
        self.requests = None;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Discovery thread panicked");
            }
        }
    }
}

fn enumerate(backend: &dyn Backend, shared: &Shared) {
    {
        let mut state = shared.state();
        state.pending = false;
        state.enumerating = true;
    }

    log::debug!("Enumerate devices");
    let result = backend.devices();

    let devices = {
        let mut state = shared.state();
        match result {
            Ok(devices) => {
                log::debug!("Found {} devices", devices.len());
                state.devices = devices;
                state.last_error = None;
            }
            Err(err) => {
                log::warn!("Failed to enumerate devices: {err}");
                state.last_error = Some(err);
            }
        }
        state.generation += 1;
        state.enumerating = false;
        state.devices.clone()
    };
    shared.changed.notify_all();

    shared
        .subscribers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|subscriber| subscriber.send(devices.clone()).is_ok());
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsane::{Credentials, DeviceHandle, TestBackend, TEST_DEVICE};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingBackend {
        inner: TestBackend,
        calls: AtomicUsize,
    }

    impl Backend for CountingBackend {
        fn devices(&self) -> libsane::Result<Vec<DeviceInfo>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.devices()
        }

        fn open(
            &self,
            name: &str,
            credentials: Option<&Credentials>,
        ) -> libsane::Result<Box<dyn DeviceHandle>> {
            self.inner.open(name, credentials)
        }
    }

    #[test]
    fn wait_enumerates_once() {
        let backend = Arc::new(CountingBackend::default());
        let discovery = DeviceDiscovery::new(backend.clone()).expect("discovery thread");

        let devices = discovery.wait();
        assert!(devices.iter().any(|device| device.name == TEST_DEVICE));
        assert_eq!(discovery.generation(), 1);

        // A finished list is served from the cache.
        discovery.wait();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert!(discovery.find(TEST_DEVICE).is_some());
        assert!(discovery.find("missing").is_none());
    }

    #[test]
    fn subscribers_see_refreshes() {
        let discovery = DeviceDiscovery::new(Arc::new(TestBackend::new())).expect("discovery thread");
        let mut updates = discovery.subscribe();

        discovery.refresh();
        let devices = updates.blocking_recv().expect("device list");
        assert!(!devices.is_empty());
    }

    #[test]
    fn select_device_asks_only_when_there_is_a_choice() {
        let discovery = DeviceDiscovery::new(Arc::new(TestBackend::new())).expect("discovery thread");

        let chosen = discovery.select_device(|devices| {
            assert!(devices.len() > 1);
            devices.last().map(|device| device.name.to_string())
        });
        assert_eq!(chosen, discovery.devices().last().map(|device| device.name.to_string()));
    }
}
