//! Autoload registry
//!
//! Records which preset gets applied to a device without user interaction.
//! Lives in the `autoload` list of [`Config`], one entry per device.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::settings::Config;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoloadEntry {
    pub device: String,
    pub preset: String,
}

impl Config {
    /// The preset autoloaded for a device, if any
    pub fn autoloaded_preset(&self, device: &str) -> Option<&str> {
        self.autoload
            .iter()
            .find(|entry| entry.device == device)
            .map(|entry| entry.preset.as_str())
            .filter(|preset| !preset.is_empty())
    }

    pub fn is_autoloaded(&self, device: &str, preset: &str) -> bool {
        self.autoloaded_preset(device) == Some(preset)
    }

    /// Enable or disable autoloading of a preset for a device
    ///
    /// Enabling replaces whatever was set for the device. Disabling only
    /// clears the entry if it currently names this preset.
    pub fn set_autoload(&mut self, device: &str, preset: &str, enabled: bool) {
        if enabled {
            match self.autoload.iter_mut().find(|entry| entry.device == device) {
                Some(entry) => entry.preset = preset.to_string(),
                None => self.autoload.push(AutoloadEntry {
                    device: device.to_string(),
                    preset: preset.to_string(),
                }),
            }
            info!(device = %device, preset = %preset, "Enabled autoload");
        } else if self.is_autoloaded(device, preset) {
            self.autoload.retain(|entry| entry.device != device);
            info!(device = %device, preset = %preset, "Disabled autoload");
        }
    }

    /// (device, preset) pairs to autoload, in config order
    ///
    /// Every call starts a fresh iteration over the current entries.
    pub fn iterate_autoload_presets(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.autoload
            .iter()
            .filter(|entry| !entry.preset.is_empty())
            .map(|entry| (entry.device.as_str(), entry.preset.as_str()))
    }

    /// Follow a preset rename so autoload keeps pointing at it
    pub fn rename_autoload(&mut self, device: &str, old_name: &str, new_name: &str) {
        if let Some(entry) = self
            .autoload
            .iter_mut()
            .find(|entry| entry.device == device && entry.preset == old_name)
        {
            entry.preset = new_name.to_string();
        }
    }
}
