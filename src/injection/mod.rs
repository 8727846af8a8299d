//! Injection controller
//!
//! One worker per device grabs the device's event nodes, rewrites key codes
//! with a [`KeyTable`] snapshot and writes them to a virtual device. Workers
//! run isolated in their own process ([`process::ProcessLauncher`]) or on a
//! thread ([`thread::ThreadLauncher`]), behind the [`Launcher`] seam.

pub mod process;
pub mod table;
pub mod thread;
pub mod worker;

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::time::Duration;
use tracing::{error, info, warn};

use table::{KeyEvent, KeyTable};

/// Everything a worker needs to start
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub device: String,
    pub paths: Vec<PathBuf>,
    pub table: KeyTable,
}

/// Starts workers
pub trait Launcher {
    /// Returns once the worker has its devices open, or fails
    fn launch(&self, request: LaunchRequest) -> Result<Box<dyn Session>>;
}

/// Handle to one running worker
pub trait Session: Send {
    fn is_running(&mut self) -> bool;

    /// Receiver of every emitted event, can be taken once
    fn take_relay(&mut self) -> Option<Receiver<KeyEvent>>;

    /// Ask the worker to exit and wait at most `timeout` for it
    fn stop(&mut self, timeout: Duration) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Per-device injection sessions
///
/// `apply` and `stop` are synchronous: `Starting` and `Stopping` only exist
/// while one of them is on the stack, so `state` reports `Idle` or `Running`
/// to callers.
pub struct Injector {
    launcher: Box<dyn Launcher>,
    sessions: HashMap<String, Box<dyn Session>>,
    states: HashMap<String, SessionState>,
    stop_timeout: Duration,
}

impl Injector {
    pub fn new(launcher: Box<dyn Launcher>, stop_timeout: Duration) -> Self {
        Self {
            launcher,
            sessions: HashMap::new(),
            states: HashMap::new(),
            stop_timeout,
        }
    }

    /// Start injecting into `device`, replacing a running session
    pub fn apply(&mut self, device: &str, paths: Vec<PathBuf>, table: KeyTable) -> Result<()> {
        if self.sessions.contains_key(device) {
            info!(device = %device, "Restarting injection");
            self.stop(device)?;
        }

        self.states.insert(device.to_string(), SessionState::Starting);
        let request = LaunchRequest {
            device: device.to_string(),
            paths,
            table,
        };
        match self.launcher.launch(request) {
            Ok(session) => {
                self.sessions.insert(device.to_string(), session);
                self.states.insert(device.to_string(), SessionState::Running);
                info!(device = %device, "Injection running");
                Ok(())
            }
            Err(e) => {
                self.states.remove(device);
                error!(device = %device, error = %e, "Failed to start injection");
                Err(e).with_context(|| format!("Failed to start injection for {device:?}"))
            }
        }
    }

    /// Stop the device's worker, a no-op when nothing runs
    ///
    /// The session is dropped even when the worker didn't acknowledge in
    /// time; the error reports that.
    pub fn stop(&mut self, device: &str) -> Result<()> {
        let Some(mut session) = self.sessions.remove(device) else {
            return Ok(());
        };

        self.states.insert(device.to_string(), SessionState::Stopping);
        let result = session.stop(self.stop_timeout);
        self.states.remove(device);

        match &result {
            Ok(()) => info!(device = %device, "Injection stopped"),
            Err(e) => warn!(device = %device, error = %e, "Injection did not stop cleanly"),
        }
        result
    }

    pub fn stop_all(&mut self) {
        let devices: Vec<String> = self.sessions.keys().cloned().collect();
        for device in devices {
            // already logged
            let _ = self.stop(&device);
        }
    }

    pub fn state(&self, device: &str) -> SessionState {
        self.states.get(device).copied().unwrap_or(SessionState::Idle)
    }

    pub fn take_relay(&mut self, device: &str) -> Option<Receiver<KeyEvent>> {
        self.sessions.get_mut(device)?.take_relay()
    }

    /// Devices whose worker is still alive
    ///
    /// Sessions whose worker exited on its own (device unplugged, crash) are
    /// dropped here.
    pub fn running_devices(&mut self) -> Vec<String> {
        let exited: Vec<String> = self
            .sessions
            .iter_mut()
            .filter_map(|(device, session)| (!session.is_running()).then(|| device.clone()))
            .collect();
        for device in exited {
            warn!(device = %device, "Injection worker exited");
            self.sessions.remove(&device);
            self.states.remove(&device);
        }

        let mut devices: Vec<String> = self.sessions.keys().cloned().collect();
        devices.sort();
        devices
    }
}

impl Drop for Injector {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::constants::input::{KEY_PRESS, KEY_RELEASE};
    use crate::injection::thread::ThreadLauncher;
    use crate::injection::worker::{EventSink, EventSource};
    use crate::mapping::Mapping;
    use anyhow::bail;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::thread::sleep;

    type Opened = (Box<dyn EventSource>, Box<dyn EventSink>);

    /// Replays a list of events, one per `delay`, then closes
    pub(crate) struct ScriptedSource {
        events: VecDeque<KeyEvent>,
        delay: Duration,
    }

    impl ScriptedSource {
        pub(crate) fn new(events: Vec<KeyEvent>, delay: Duration) -> Self {
            Self {
                events: events.into(),
                delay,
            }
        }
    }

    impl EventSource for ScriptedSource {
        fn next_batch(&mut self, _timeout: Duration) -> Result<Option<Vec<KeyEvent>>> {
            sleep(self.delay);
            Ok(self.events.pop_front().map(|event| vec![event]))
        }
    }

    /// Records into a shared vec
    pub(crate) struct RecordingSink(pub(crate) Arc<Mutex<Vec<KeyEvent>>>);

    impl EventSink for RecordingSink {
        fn emit(&mut self, events: &[KeyEvent]) -> Result<()> {
            self.0.lock().unwrap().extend_from_slice(events);
            Ok(())
        }
    }

    /// Ten down/up pairs on X keycode 9
    pub(crate) fn key_presses() -> Vec<KeyEvent> {
        (0..10)
            .flat_map(|_| {
                [
                    KeyEvent::key(9 - 8, KEY_PRESS),
                    KeyEvent::key(9 - 8, KEY_RELEASE),
                ]
            })
            .collect()
    }

    fn table_9_to_200() -> KeyTable {
        let mut custom = Mapping::new();
        custom.change(&9, "a", None);
        let mut system = Mapping::new();
        system.change(&200, "a", None);
        KeyTable::from_mappings(&custom, &system)
    }

    fn scripted_injector(delay: Duration) -> (Injector, Arc<Mutex<Vec<KeyEvent>>>) {
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&emitted);
        let launcher = ThreadLauncher::new(
            Box::new(move |_request: &LaunchRequest| -> Result<Opened> {
                let source: Box<dyn EventSource> =
                    Box::new(ScriptedSource::new(key_presses(), delay));
                let sink: Box<dyn EventSink> = Box::new(RecordingSink(Arc::clone(&sink_events)));
                Ok((source, sink))
            }),
            1024,
        );
        (
            Injector::new(Box::new(launcher), Duration::from_secs(2)),
            emitted,
        )
    }

    #[test]
    fn test_injection_translates_in_order() {
        let (mut injector, emitted) = scripted_injector(Duration::from_millis(1));
        injector
            .apply("device 1", vec![], table_9_to_200())
            .unwrap();
        assert_eq!(injector.state("device 1"), SessionState::Running);
        let relay = injector.take_relay("device 1").unwrap();

        let mut received = Vec::new();
        while let Ok(event) = relay.recv_timeout(Duration::from_secs(2)) {
            received.push(event);
        }

        let expected: Vec<KeyEvent> = (0..10)
            .flat_map(|_| {
                [
                    KeyEvent::key(200 - 8, KEY_PRESS),
                    KeyEvent::key(200 - 8, KEY_RELEASE),
                ]
            })
            .collect();
        assert_eq!(received, expected);
        assert_eq!(*emitted.lock().unwrap(), expected);

        // the scripted source closed, the worker is gone
        assert!(injector.running_devices().is_empty());
        assert_eq!(injector.state("device 1"), SessionState::Idle);
    }

    #[test]
    fn test_stop_after_first_event() {
        let (mut injector, _emitted) = scripted_injector(Duration::from_millis(20));
        injector
            .apply("device 1", vec![], table_9_to_200())
            .unwrap();
        let relay = injector.take_relay("device 1").unwrap();

        let first = relay.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first, KeyEvent::key(192, KEY_PRESS));
        injector.stop("device 1").unwrap();
        assert_eq!(injector.state("device 1"), SessionState::Idle);

        let mut count = 1;
        while relay.try_recv().is_ok() {
            count += 1;
        }
        assert!(count < key_presses().len());

        // nothing more after a while
        sleep(Duration::from_millis(100));
        assert!(relay.try_recv().is_err());
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let (mut injector, _emitted) = scripted_injector(Duration::from_millis(1));
        injector.stop("device 1").unwrap();
        assert_eq!(injector.state("device 1"), SessionState::Idle);
    }

    #[test]
    fn test_apply_replaces_running_session() {
        let (mut injector, _emitted) = scripted_injector(Duration::from_millis(50));
        injector
            .apply("device 1", vec![], table_9_to_200())
            .unwrap();
        let first_relay = injector.take_relay("device 1").unwrap();

        injector
            .apply("device 1", vec![], KeyTable::default())
            .unwrap();
        assert_eq!(injector.running_devices(), vec!["device 1"]);

        // the first worker is gone, its relay disconnects
        sleep(Duration::from_millis(100));
        while first_relay.try_recv().is_ok() {}
        assert!(matches!(
            first_relay.try_recv(),
            Err(std::sync::mpsc::TryRecvError::Disconnected)
        ));

        // the second one passes keys through unchanged
        let second_relay = injector.take_relay("device 1").unwrap();
        let event = second_relay.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event, KeyEvent::key(1, KEY_PRESS));
        injector.stop_all();
        assert!(injector.running_devices().is_empty());
    }

    /// Worker that is already gone when the launch returns
    struct ExitedSession;

    impl Session for ExitedSession {
        fn is_running(&mut self) -> bool {
            false
        }

        fn take_relay(&mut self) -> Option<Receiver<KeyEvent>> {
            None
        }

        fn stop(&mut self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
    }

    struct ExitedLauncher;

    impl Launcher for ExitedLauncher {
        fn launch(&self, _request: LaunchRequest) -> Result<Box<dyn Session>> {
            Ok(Box::new(ExitedSession))
        }
    }

    #[test]
    fn test_running_devices_drops_exited_workers() {
        let mut injector = Injector::new(Box::new(ExitedLauncher), Duration::from_secs(1));
        injector
            .apply("device 1", vec![], KeyTable::default())
            .unwrap();
        assert_eq!(injector.state("device 1"), SessionState::Running);

        assert!(injector.running_devices().is_empty());
        assert_eq!(injector.state("device 1"), SessionState::Idle);
        // nothing left to stop
        injector.stop("device 1").unwrap();
    }

    #[test]
    fn test_failed_start_leaves_device_idle() {
        let launcher = ThreadLauncher::new(
            Box::new(|request: &LaunchRequest| -> Result<Opened> {
                bail!("cannot open {}", request.device)
            }),
            16,
        );
        let mut injector = Injector::new(Box::new(launcher), Duration::from_secs(1));

        assert!(injector.apply("device 1", vec![], KeyTable::default()).is_err());
        assert_eq!(injector.state("device 1"), SessionState::Idle);
        assert!(injector.running_devices().is_empty());
        assert!(injector.take_relay("device 1").is_none());
    }
}
