//! Directory-backed catalog of named presets per device
//!
//! Layout: `<root>/<device name>/<preset name>.json`. The device name is used
//! verbatim as directory name. Ordering always comes from file modification
//! times, never from directory iteration order.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;
use tracing::{debug, error, info, warn};

use crate::constants::config::PRESET_EXTENSION;

/// (device, preset) pair, either side may be unknown
pub type PresetRef = (Option<String>, Option<String>);

pub struct PresetStore {
    root: PathBuf,
}

impl PresetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn device_dir(&self, device: &str) -> PathBuf {
        self.root.join(device)
    }

    pub fn preset_path(&self, device: &str, preset: &str) -> PathBuf {
        self.device_dir(device)
            .join(format!("{preset}.{PRESET_EXTENSION}"))
    }

    /// Preset files of a device with their modification time
    ///
    /// Files that can't be stat'ed are skipped with a warning.
    fn presets_with_mtime(&self, device: &str) -> Vec<(String, SystemTime)> {
        let dir = self.device_dir(device);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut presets = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PRESET_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match entry.metadata().and_then(|m| {
                if m.is_file() {
                    m.modified().map(Some)
                } else {
                    Ok(None)
                }
            }) {
                Ok(Some(mtime)) => presets.push((name.to_string(), mtime)),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to stat preset"),
            }
        }
        presets
    }

    /// Preset names of a device, most recently modified first
    ///
    /// Equal timestamps are ordered by name.
    pub fn get_presets(&self, device: &str) -> Vec<String> {
        let mut presets = self.presets_with_mtime(device);
        presets.sort_by(|(a_name, a_time), (b_name, b_time)| {
            b_time.cmp(a_time).then_with(|| a_name.cmp(b_name))
        });
        presets.into_iter().map(|(name, _)| name).collect()
    }

    /// Device directories currently in the store, sorted by name
    pub fn list_devices(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut devices: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .collect();
        devices.sort();
        devices
    }

    /// A name for a new preset of the device that isn't taken yet
    ///
    /// Returns the trimmed proposal if it is free. Otherwise a numeric suffix
    /// is appended, starting at 2, or an existing trailing number is
    /// incremented, until an unused name is found.
    pub fn get_available_preset_name(&self, device: &str, proposed_name: &str) -> String {
        let name = proposed_name.trim();
        let existing: HashSet<String> = self.get_presets(device).into_iter().collect();
        if !existing.contains(name) {
            return name.to_string();
        }

        let numbered = name
            .rsplit_once(' ')
            .filter(|(base, _)| !base.is_empty())
            .and_then(|(base, number)| Some((base, number.parse::<u32>().ok()?.checked_add(1)?)));
        if let Some(candidate) = numbered.and_then(|(base, next)| first_free(&existing, base, next)) {
            return candidate;
        }
        // no trailing number to continue from, number the whole name
        first_free(&existing, name, 2).unwrap_or_else(|| format!("{name} {}", existing.len() + 2))
    }

    /// Most recently modified preset
    ///
    /// With a device: that device and its newest preset, if any.
    ///
    /// Without: the (device, preset) with the newest file among
    /// `known_devices`. Presets of unknown devices are ignored. If no known
    /// device has presets the first known device is returned without a
    /// preset, and `(None, None)` if there are no known devices at all.
    /// Equal timestamps prefer the device listed first, then the smaller name.
    pub fn find_newest_preset(&self, known_devices: &[String], device: Option<&str>) -> PresetRef {
        if let Some(device) = device {
            let newest = self.get_presets(device).into_iter().next();
            return (Some(device.to_string()), newest);
        }

        let Some(first_device) = known_devices.first() else {
            debug!("No known devices");
            return (None, None);
        };

        let mut newest: Option<(SystemTime, &String, String)> = None;
        for device in known_devices {
            for (name, mtime) in self.presets_with_mtime(device) {
                let is_newer = match &newest {
                    None => true,
                    Some((best_time, best_device, best_name)) => {
                        mtime > *best_time
                            || (mtime == *best_time
                                && *best_device == device
                                && name < *best_name)
                    }
                };
                if is_newer {
                    newest = Some((mtime, device, name));
                }
            }
        }

        match newest {
            Some((_, device, preset)) => {
                debug!(device = %device, preset = %preset, "Found newest preset");
                (Some(device.clone()), Some(preset))
            }
            None => (Some(first_device.clone()), None),
        }
    }

    /// Some valid (device, preset) pair, preferring an existing preset
    pub fn get_any_preset(&self, known_devices: &[String]) -> PresetRef {
        self.find_newest_preset(known_devices, None)
    }

    /// Rename a preset, picking an available name if `new_name` is taken
    ///
    /// Returns the name the preset ended up with, or `None` if the source
    /// preset does not exist or the new name is unusable.
    pub fn rename_preset(&self, device: &str, old_name: &str, new_name: &str) -> Result<Option<String>> {
        let new_name = new_name.trim();
        if !is_valid_name(new_name) {
            error!(device = %device, name = %new_name, "Invalid preset name");
            return Ok(None);
        }

        let old_path = self.preset_path(device, old_name);
        if !old_path.exists() {
            error!(path = %old_path.display(), "Tried to rename non-existing preset");
            return Ok(None);
        }
        if old_name == new_name {
            return Ok(Some(new_name.to_string()));
        }

        let new_name = self.get_available_preset_name(device, new_name);
        let new_path = self.preset_path(device, &new_name);
        fs::rename(&old_path, &new_path).with_context(|| {
            format!("Failed to move preset {:?} to {:?}", old_path, new_path)
        })?;

        info!(device = %device, from = %old_name, to = %new_name, "Renamed preset");
        Ok(Some(new_name))
    }

    /// Delete a preset, removing the device directory once it is empty
    ///
    /// Returns false if there was no such preset.
    pub fn delete_preset(&self, device: &str, name: &str) -> Result<bool> {
        let path = self.preset_path(device, name);
        if !path.exists() {
            warn!(path = %path.display(), "Tried to delete non-existing preset");
            return Ok(false);
        }

        fs::remove_file(&path).with_context(|| format!("Failed to remove preset {:?}", path))?;
        info!(device = %device, preset = %name, "Deleted preset");

        let dir = self.device_dir(device);
        let is_empty = fs::read_dir(&dir)
            .with_context(|| format!("Failed to read device directory {:?}", dir))?
            .next()
            .is_none();
        if is_empty {
            fs::remove_dir(&dir)
                .with_context(|| format!("Failed to remove device directory {:?}", dir))?;
            debug!(device = %device, "Removed empty device directory");
        }

        Ok(true)
    }
}

/// First `"{base} {n}"` not in `existing`, counting up from `start`
fn first_free(existing: &HashSet<String>, base: &str, start: u32) -> Option<String> {
    let mut suffix = start;
    // at most existing.len() candidates can be taken
    for _ in 0..=existing.len() {
        let candidate = format!("{base} {suffix}");
        if !existing.contains(&candidate) {
            return Some(candidate);
        }
        suffix = suffix.checked_add(1)?;
    }
    None
}

/// Preset names end up as file names inside the device directory
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}
