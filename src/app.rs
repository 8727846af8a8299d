//! Application context
//!
//! Owns the system and custom mappings together with the preset store,
//! configuration, device catalog and injector. Everything that used to be
//! shared state lives here and is handed out by reference.

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::constants::config::{DEFAULT_PRESET_NAME, PRESETS_DIR};
use crate::devices::DeviceCatalog;
use crate::injection::table::KeyTable;
use crate::injection::{Injector, Launcher, SessionState};
use crate::mapping::{LoadOutcome, Mapping};
use crate::presets::{self, PresetStore};

pub struct AppContext {
    /// Keycode → symbols of the running X session
    pub system_mapping: Mapping,
    /// The preset being edited
    pub custom_mapping: Mapping,
    pub store: PresetStore,
    pub config: Config,
    config_path: PathBuf,
    pub devices: DeviceCatalog,
    pub injector: Injector,
    /// (device, preset) the custom mapping belongs to
    selected: Option<(String, String)>,
}

impl AppContext {
    pub fn new(
        config_dir: &Path,
        config: Config,
        devices: DeviceCatalog,
        system_mapping: Mapping,
        launcher: Box<dyn Launcher>,
    ) -> Self {
        let injector = Injector::new(launcher, config.injection.stop_timeout());
        Self {
            system_mapping,
            custom_mapping: Mapping::new(),
            store: PresetStore::new(config_dir.join(PRESETS_DIR)),
            config,
            config_path: Config::path_in(config_dir),
            devices,
            injector,
            selected: None,
        }
    }

    pub fn known_devices(&self) -> Vec<String> {
        self.devices.names()
    }

    pub fn selected(&self) -> Option<(&str, &str)> {
        self.selected
            .as_ref()
            .map(|(device, preset)| (device.as_str(), preset.as_str()))
    }

    /// Save an empty preset under a free name and start editing it
    pub fn create_preset(&mut self, device: &str, name: Option<&str>) -> Result<String> {
        let name = self
            .store
            .get_available_preset_name(device, name.unwrap_or(DEFAULT_PRESET_NAME));
        if !presets::is_valid_name(&name) {
            bail!("Invalid preset name {name:?}");
        }

        let mut mapping = Mapping::new();
        mapping.save(&self.store, device, &name)?;
        info!(device = %device, preset = %name, "Created preset");

        self.custom_mapping = mapping;
        self.selected = Some((device.to_string(), name.clone()));
        Ok(name)
    }

    /// Edit the device's newest preset, creating one if it has none
    pub fn select_device(&mut self, device: &str) -> Result<String> {
        let known = self.known_devices();
        match self.store.find_newest_preset(&known, Some(device)) {
            (_, Some(preset)) => match self.load_preset(device, &preset) {
                LoadOutcome::Loaded { .. } => Ok(preset),
                outcome => bail!("Failed to load {preset:?} of {device:?}: {outcome:?}"),
            },
            (_, None) => self.create_preset(device, None),
        }
    }

    /// Replace the custom mapping with a stored preset
    ///
    /// The selection only changes when the load succeeds.
    pub fn load_preset(&mut self, device: &str, preset: &str) -> LoadOutcome {
        let outcome = self.custom_mapping.load(&self.store, device, preset);
        if let LoadOutcome::Loaded { .. } = outcome {
            self.selected = Some((device.to_string(), preset.to_string()));
        }
        outcome
    }

    /// Write the custom mapping to `preset`, renaming it to `new_name` after
    ///
    /// Returns the name the preset ended up with, which differs from
    /// `new_name` when that was taken.
    pub fn save_preset(&mut self, device: &str, preset: &str, new_name: Option<&str>) -> Result<String> {
        self.custom_mapping.save(&self.store, device, preset)?;
        self.selected = Some((device.to_string(), preset.to_string()));

        let Some(new_name) = new_name.map(str::trim).filter(|name| *name != preset) else {
            return Ok(preset.to_string());
        };
        match self.rename_preset(device, preset, new_name)? {
            Some(renamed) => Ok(renamed),
            None => {
                warn!(device = %device, preset = %preset, "Preset kept its name");
                Ok(preset.to_string())
            }
        }
    }

    /// Rename a stored preset, autoload follows
    ///
    /// `None` when there is no such preset or the name is unusable.
    pub fn rename_preset(&mut self, device: &str, preset: &str, new_name: &str) -> Result<Option<String>> {
        let Some(renamed) = self.store.rename_preset(device, preset, new_name)? else {
            return Ok(None);
        };
        if self.config.is_autoloaded(device, preset) {
            self.config.rename_autoload(device, preset, &renamed);
            self.save_config()?;
        }
        if self.selected() == Some((device, preset)) {
            self.selected = Some((device.to_string(), renamed.clone()));
        }
        Ok(Some(renamed))
    }

    /// Delete a preset and its autoload entry
    pub fn delete_preset(&mut self, device: &str, preset: &str) -> Result<bool> {
        let deleted = self.store.delete_preset(device, preset)?;

        if self.config.is_autoloaded(device, preset) {
            self.config.set_autoload(device, preset, false);
            self.save_config()?;
        }

        if self.selected() == Some((device, preset)) {
            self.custom_mapping = Mapping::new();
            self.selected = None;
        }
        Ok(deleted)
    }

    /// Start injecting a stored preset into a device
    ///
    /// The preset is read from disk, unsaved edits of the custom mapping
    /// are not applied.
    pub fn apply_preset(&mut self, device: &str, preset: &str) -> Result<()> {
        let Some(paths) = self.devices.paths(device) else {
            bail!("Unknown device {device:?}");
        };
        let paths = paths.to_vec();

        let mut mapping = Mapping::new();
        match mapping.load(&self.store, device, preset) {
            LoadOutcome::Loaded { .. } => {}
            outcome => bail!("Cannot apply {preset:?} of {device:?}: {outcome:?}"),
        }

        let table = KeyTable::from_mappings(&mapping, &self.system_mapping);
        if table.is_empty() {
            warn!(device = %device, preset = %preset, "Preset maps no keys, events pass through unchanged");
        }
        info!(device = %device, preset = %preset, mapped_keys = table.len(), "Applying preset");
        self.injector.apply(device, paths, table)
    }

    /// Stop injecting so the device behaves like the system layout again
    pub fn apply_system_layout(&mut self, device: &str) -> Result<()> {
        info!(device = %device, "Applying system layout");
        self.injector.stop(device)
    }

    /// Change the autoload registry and persist it
    pub fn set_autoload(&mut self, device: &str, preset: &str, enabled: bool) -> Result<()> {
        self.config.set_autoload(device, preset, enabled);
        self.save_config()
    }

    /// Apply every autoloaded preset whose device is plugged in
    ///
    /// Devices that are already injecting are left alone. Failures are
    /// logged and skipped. Returns how many sessions started.
    pub fn start_autoload(&mut self) -> usize {
        let pairs: Vec<(String, String)> = self
            .config
            .iterate_autoload_presets()
            .map(|(device, preset)| (device.to_string(), preset.to_string()))
            .collect();

        let mut started = 0;
        for (device, preset) in pairs {
            if self.devices.paths(&device).is_none() {
                warn!(device = %device, "Autoload device not connected, skipping");
                continue;
            }
            if self.injector.state(&device) == SessionState::Running {
                info!(device = %device, "Already injecting, skipping autoload");
                continue;
            }
            match self.apply_preset(&device, &preset) {
                Ok(()) => started += 1,
                Err(e) => error!(device = %device, preset = %preset, error = %e, "Autoload failed"),
            }
        }
        info!(started, "Autoload done");
        started
    }

    fn save_config(&self) -> Result<()> {
        self.config
            .save_to(&self.config_path)
            .context("Failed to persist configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::input::KEY_PRESS;
    use crate::injection::table::KeyEvent;
    use crate::injection::tests::{RecordingSink, ScriptedSource, key_presses};
    use crate::injection::thread::ThreadLauncher;
    use crate::injection::worker::{EventSink, EventSource};
    use crate::injection::LaunchRequest;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    fn context(dir: &Path) -> AppContext {
        let devices = DeviceCatalog::from_devices(vec![
            ("device 1".to_string(), PathBuf::from("/dev/input/event10")),
            ("device 2".to_string(), PathBuf::from("/dev/input/event11")),
        ]);
        let mut system_mapping = Mapping::new();
        system_mapping.change(&200, vec!["a", "A"], None);
        system_mapping.change(&38, "b", None);

        let launcher = ThreadLauncher::new(
            Box::new(
                |_request: &LaunchRequest| -> Result<(Box<dyn EventSource>, Box<dyn EventSink>)> {
                    Ok((
                        Box::new(ScriptedSource::new(key_presses(), Duration::from_millis(5))),
                        Box::new(RecordingSink(Arc::new(Mutex::new(Vec::new())))),
                    ))
                },
            ),
            64,
        );
        AppContext::new(
            dir,
            Config::default(),
            devices,
            system_mapping,
            Box::new(launcher),
        )
    }

    #[test]
    fn test_create_preset_twice() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path());

        assert_eq!(ctx.create_preset("device 1", None).unwrap(), "new preset");
        assert_eq!(ctx.create_preset("device 1", None).unwrap(), "new preset 2");

        assert!(ctx.store.preset_path("device 1", "new preset").exists());
        assert!(ctx.store.preset_path("device 1", "new preset 2").exists());
        assert_eq!(ctx.selected(), Some(("device 1", "new preset 2")));
    }

    #[test]
    fn test_select_device_creates_or_loads() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path());

        assert_eq!(ctx.select_device("device 2").unwrap(), "new preset");

        ctx.custom_mapping.change(&10, "b", None);
        ctx.save_preset("device 2", "new preset", None).unwrap();
        ctx.custom_mapping = Mapping::new();

        assert_eq!(ctx.select_device("device 2").unwrap(), "new preset");
        assert_eq!(
            ctx.custom_mapping.get_character(10).map(|c| c.to_string()),
            Some("b".to_string())
        );
        assert!(!ctx.custom_mapping.changed);
    }

    #[test]
    fn test_save_with_rename_follows_autoload() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path());
        ctx.create_preset("device 1", Some("foo")).unwrap();
        ctx.create_preset("device 1", Some("bar")).unwrap();
        ctx.set_autoload("device 1", "foo", true).unwrap();

        ctx.load_preset("device 1", "foo");
        ctx.custom_mapping.change(&10, "a", None);
        // "bar" is taken
        let name = ctx.save_preset("device 1", "foo", Some("bar")).unwrap();
        assert_eq!(name, "bar 2");
        assert_eq!(ctx.selected(), Some(("device 1", "bar 2")));
        assert!(!ctx.store.preset_path("device 1", "foo").exists());
        assert!(ctx.store.preset_path("device 1", "bar 2").exists());
        assert!(ctx.config.is_autoloaded("device 1", "bar 2"));

        // persisted
        let saved = Config::load_from(&Config::path_in(dir.path())).unwrap();
        assert!(saved.is_autoloaded("device 1", "bar 2"));
    }

    #[test]
    fn test_create_preset_rejects_path_names() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path());

        assert!(ctx.create_preset("device 1", Some("../device 2/evil")).is_err());
        assert!(ctx.create_preset("device 1", Some("  ")).is_err());
        assert!(ctx.store.get_presets("device 2").is_empty());
        assert!(ctx.store.get_presets("device 1").is_empty());
        assert_eq!(ctx.selected(), None);
    }

    #[test]
    fn test_rename_missing_preset() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path());

        assert_eq!(ctx.rename_preset("device 1", "foo", "bar").unwrap(), None);
        ctx.create_preset("device 1", Some("foo")).unwrap();
        assert_eq!(ctx.rename_preset("device 1", "foo", "a/b").unwrap(), None);
        assert_eq!(
            ctx.rename_preset("device 1", "foo", "bar").unwrap(),
            Some("bar".to_string())
        );
        assert_eq!(ctx.selected(), Some(("device 1", "bar")));
    }

    #[test]
    fn test_delete_preset_disables_autoload() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path());
        ctx.create_preset("device 1", Some("foo")).unwrap();
        ctx.set_autoload("device 1", "foo", true).unwrap();

        assert!(ctx.delete_preset("device 1", "foo").unwrap());
        assert!(!ctx.config.is_autoloaded("device 1", "foo"));
        assert_eq!(ctx.selected(), None);
        assert!(!ctx.store.device_dir("device 1").exists());

        assert!(!ctx.delete_preset("device 1", "foo").unwrap());
    }

    #[test]
    fn test_apply_preset_resolves_against_system_layout() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path());
        ctx.create_preset("device 1", Some("foo")).unwrap();
        ctx.custom_mapping.change(&9, "a", None);
        ctx.save_preset("device 1", "foo", None).unwrap();

        ctx.apply_preset("device 1", "foo").unwrap();
        assert_eq!(ctx.injector.state("device 1"), SessionState::Running);

        let relay = ctx.injector.take_relay("device 1").unwrap();
        let event = relay.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event, KeyEvent::key(200 - 8, KEY_PRESS));

        ctx.apply_system_layout("device 1").unwrap();
        assert_eq!(ctx.injector.state("device 1"), SessionState::Idle);
    }

    #[test]
    fn test_apply_unsaved_edits_are_not_injected() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path());
        ctx.create_preset("device 1", Some("foo")).unwrap();
        ctx.custom_mapping.change(&9, "a", None);

        ctx.apply_preset("device 1", "foo").unwrap();
        let relay = ctx.injector.take_relay("device 1").unwrap();
        let event = relay.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event, KeyEvent::key(9 - 8, KEY_PRESS));
    }

    #[test]
    fn test_apply_failures_leave_device_idle() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path());

        // no such preset
        assert!(ctx.apply_preset("device 1", "foo").is_err());
        // not plugged in
        ctx.create_preset("device 3", Some("foo")).unwrap();
        assert!(ctx.apply_preset("device 3", "foo").is_err());

        assert_eq!(ctx.injector.state("device 1"), SessionState::Idle);
        assert!(ctx.injector.running_devices().is_empty());
    }

    #[test]
    fn test_start_autoload() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path());
        ctx.create_preset("device 1", Some("foo")).unwrap();
        ctx.create_preset("device 3", Some("bar")).unwrap();
        ctx.set_autoload("device 1", "foo", true).unwrap();
        ctx.set_autoload("device 3", "bar", true).unwrap();
        ctx.set_autoload("device 2", "missing", true).unwrap();

        // device 3 isn't connected, device 2's preset doesn't exist
        assert_eq!(ctx.start_autoload(), 1);
        assert_eq!(ctx.injector.state("device 1"), SessionState::Running);
        assert_eq!(ctx.injector.state("device 2"), SessionState::Idle);

        // a second run leaves the running session alone
        assert_eq!(ctx.start_autoload(), 0);
        assert_eq!(ctx.injector.state("device 1"), SessionState::Running);

        ctx.injector.stop_all();
    }
}
