use anyhow::{Context, Result, bail};
use evdev::uinput::VirtualDevice;
use evdev::{AttributeSet, Device, InputEvent, KeyCode};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::constants::injection::VIRTUAL_DEVICE_NAME;
use crate::constants::input::{EV_SYN, KEY_MAX};
use crate::constants::{paths, permissions};
use crate::injection::table::KeyEvent;
use crate::injection::worker::{EventSink, EventSource};
use crate::injection::LaunchRequest;

/// Keyboards by name, each with all of its event nodes
///
/// A single physical keyboard often shows up as several event nodes that
/// share a name; they are grabbed together.
#[derive(Debug, Clone, Default)]
pub struct DeviceCatalog {
    devices: Vec<(String, Vec<PathBuf>)>,
}

impl DeviceCatalog {
    /// Group (name, path) pairs, keeping the order names first appear in
    pub fn from_devices(devices: impl IntoIterator<Item = (String, PathBuf)>) -> Self {
        let mut catalog = Self::default();
        for (name, path) in devices {
            match catalog.devices.iter_mut().find(|(n, _)| *n == name) {
                Some((_, paths)) => paths.push(path),
                None => catalog.devices.push((name, vec![path])),
            }
        }
        catalog
    }

    pub fn names(&self) -> Vec<String> {
        self.devices.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn paths(&self, name: &str) -> Option<&[PathBuf]> {
        self.devices
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, paths)| paths.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Find all keyboard devices under /dev/input
pub fn find_keyboards() -> Result<DeviceCatalog> {
    info!(path = %paths::DEV_INPUT, "Scanning for keyboard devices...");

    let mut nodes: Vec<(u32, PathBuf)> = std::fs::read_dir(paths::DEV_INPUT)
        .context(format!(
            "Failed to read {} - are you in the '{}' group?",
            paths::DEV_INPUT,
            permissions::INPUT_GROUP
        ))?
        .flatten()
        .filter_map(|entry| {
            let number = entry
                .file_name()
                .to_str()?
                .strip_prefix(paths::EVENT_NODE_PREFIX)?
                .parse()
                .ok()?;
            Some((number, entry.path()))
        })
        .collect();
    // event2 before event10
    nodes.sort();

    let mut found = Vec::new();
    for (_, path) in nodes {
        // Try to open device
        let Ok(device) = Device::open(&path) else {
            debug!(device_path = %path.display(), "Cannot open device, skipping");
            continue;
        };
        let name = device.name().unwrap_or("unknown").to_string();
        if name == VIRTUAL_DEVICE_NAME {
            continue;
        }
        // Check if it has letter keys (indicates keyboard)
        if let Some(keys) = device.supported_keys() {
            if keys.contains(KeyCode::KEY_A) {
                info!(device_path = %path.display(), name = %name, "Found keyboard device");
                found.push((name, path));
            }
        }
    }

    let catalog = DeviceCatalog::from_devices(found);
    if catalog.is_empty() {
        print_permission_error();
    }
    info!(count = catalog.names().len(), "Found keyboard(s)");
    Ok(catalog)
}

/// Print helpful error message if no device is accessible
pub fn print_permission_error() {
    error!(path = %paths::DEV_INPUT, "No accessible keyboard devices");
    error!(group = %permissions::INPUT_GROUP, "Reading and grabbing devices requires group membership");
    error!(command = %permissions::ADD_TO_INPUT_GROUP, "Add user to input group");
    error!("  Then log out and back in");
}

impl From<InputEvent> for KeyEvent {
    fn from(event: InputEvent) -> Self {
        Self {
            kind: event.event_type().0,
            code: event.code(),
            value: event.value(),
        }
    }
}

/// Grabbed evdev nodes of one keyboard
pub struct EvdevSource {
    devices: Vec<Device>,
}

impl EvdevSource {
    /// Open and grab every node so the original events don't reach the system
    pub fn open(paths: &[PathBuf]) -> Result<Self> {
        if paths.is_empty() {
            bail!("No event nodes to read from");
        }

        let mut devices = Vec::with_capacity(paths.len());
        for path in paths {
            let mut device = Device::open(path)
                .with_context(|| format!("Failed to open evdev device: {path:?}"))?;
            device
                .grab()
                .with_context(|| format!("Failed to grab evdev device: {path:?}"))?;
            info!(device_path = %path.display(), name = ?device.name(), "Grabbed device");
            devices.push(device);
        }
        Ok(Self { devices })
    }
}

impl EventSource for EvdevSource {
    fn next_batch(&mut self, timeout: Duration) -> Result<Option<Vec<KeyEvent>>> {
        let timeout = PollTimeout::from(u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX));

        let ready: Vec<usize> = {
            let mut fds: Vec<PollFd> = self
                .devices
                .iter()
                .map(|device| PollFd::new(device.as_fd(), PollFlags::POLLIN))
                .collect();
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(Some(Vec::new())),
                Ok(_) => {}
                // a signal arrived, let the caller look at its stop flag
                Err(Errno::EINTR) => return Ok(Some(Vec::new())),
                Err(e) => return Err(e).context("Failed to poll input devices"),
            }
            fds.iter()
                .enumerate()
                .filter(|(_, fd)| fd.revents().is_some_and(|r| !r.is_empty()))
                .map(|(i, _)| i)
                .collect()
        };

        let mut events = Vec::new();
        for index in ready {
            match self.devices[index].fetch_events() {
                Ok(batch) => events.extend(batch.map(KeyEvent::from)),
                Err(e) if e.raw_os_error() == Some(Errno::ENODEV as i32) => {
                    warn!("Input device was removed");
                    return Ok(None);
                }
                Err(e) => return Err(e).context("Failed to fetch events"),
            }
        }
        Ok(Some(events))
    }
}

impl Drop for EvdevSource {
    fn drop(&mut self) {
        for device in &mut self.devices {
            if let Err(e) = device.ungrab() {
                debug!(error = %e, "Failed to ungrab device");
            }
        }
    }
}

/// uinput device the rewritten events go to
pub struct EvdevSink {
    device: VirtualDevice,
}

impl EvdevSink {
    pub fn create() -> Result<Self> {
        // any key may be a mapping target
        let mut keys = AttributeSet::<KeyCode>::new();
        for code in 1..=KEY_MAX {
            keys.insert(KeyCode::new(code));
        }

        let device = VirtualDevice::builder()
            .context("Failed to create uinput builder")?
            .name(VIRTUAL_DEVICE_NAME)
            .with_keys(&keys)
            .context("Failed to set key capabilities")?
            .build()
            .context("Failed to build uinput device")?;
        info!(name = VIRTUAL_DEVICE_NAME, "Virtual device created");
        Ok(Self { device })
    }
}

impl EventSink for EvdevSink {
    fn emit(&mut self, events: &[KeyEvent]) -> Result<()> {
        // emit() appends its own SYN_REPORT
        let events: Vec<InputEvent> = events
            .iter()
            .filter(|event| event.kind != EV_SYN)
            .map(|event| InputEvent::new(event.kind, event.code, event.value))
            .collect();
        if events.is_empty() {
            return Ok(());
        }
        self.device
            .emit(&events)
            .context("Failed to write to virtual device")
    }
}

/// Open real devices for a launch request
pub fn open_evdev(request: &LaunchRequest) -> Result<(Box<dyn EventSource>, Box<dyn EventSink>)> {
    let source = EvdevSource::open(&request.paths)?;
    let sink = EvdevSink::create()?;
    Ok((Box::new(source), Box::new(sink)))
}

/// Check if input devices are readable at all
pub fn check_permissions() -> bool {
    Path::new(paths::DEV_INPUT).read_dir().is_ok()
}
