//! Keycode to character mappings
//!
//! A [`Mapping`] is an ordered table from X keycode to the symbol (or list of
//! symbols) that key should produce. Two of them live in the application: the
//! system layout used as a reference and the custom mapping being edited.
//!
//! Presets are stored as JSON:
//! ```json
//! {
//!     "mapping": { "10": "a", "11": ["b", "B"] },
//!     "some_metadata": 1
//! }
//! ```

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{error, info, warn};

use crate::presets::{self, PresetStore};

/// X keycode as reported by the input subsystem plus the xkb offset
pub type Keycode = u32;

/// Key of the mapping table inside a preset file
const MAPPING_KEY: &str = "mapping";

/// Symbol(s) a keycode maps to
///
/// Most entries are a single xkb symbol name like `a`, `KP_1` or `Shift_L`.
/// The system layout stores the full column list reported by xmodmap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Character {
    Single(String),
    Multiple(Vec<String>),
}

impl Character {
    /// Empty strings and empty lists never get stored
    pub fn is_empty(&self) -> bool {
        match self {
            Character::Single(symbol) => symbol.is_empty(),
            Character::Multiple(symbols) => symbols.iter().all(|s| s.is_empty()),
        }
    }

    pub fn symbols(&self) -> &[String] {
        match self {
            Character::Single(symbol) => std::slice::from_ref(symbol),
            Character::Multiple(symbols) => symbols,
        }
    }

    /// The symbol a key press should produce
    pub fn primary(&self) -> Option<&str> {
        self.symbols()
            .iter()
            .map(String::as_str)
            .find(|s| !s.is_empty())
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols().iter().any(|s| s == symbol)
    }
}

impl fmt::Display for Character {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Character::Single(symbol) => f.write_str(symbol),
            Character::Multiple(symbols) => f.write_str(&symbols.join(", ")),
        }
    }
}

impl From<&str> for Character {
    fn from(symbol: &str) -> Self {
        Character::Single(symbol.to_string())
    }
}

impl From<String> for Character {
    fn from(symbol: String) -> Self {
        Character::Single(symbol)
    }
}

impl From<Vec<String>> for Character {
    fn from(symbols: Vec<String>) -> Self {
        Character::Multiple(symbols)
    }
}

impl From<Vec<&str>> for Character {
    fn from(symbols: Vec<&str>) -> Self {
        Character::Multiple(symbols.into_iter().map(str::to_string).collect())
    }
}

/// Anything the UI may hand over as a keycode: numbers or label text
pub trait ToKeycode {
    /// `None` if the value is not a non-negative integer
    fn to_keycode(&self) -> Option<Keycode>;
}

impl ToKeycode for u32 {
    fn to_keycode(&self) -> Option<Keycode> {
        Some(*self)
    }
}

impl ToKeycode for u16 {
    fn to_keycode(&self) -> Option<Keycode> {
        Some(Keycode::from(*self))
    }
}

impl ToKeycode for i32 {
    fn to_keycode(&self) -> Option<Keycode> {
        Keycode::try_from(*self).ok()
    }
}

impl ToKeycode for i64 {
    fn to_keycode(&self) -> Option<Keycode> {
        Keycode::try_from(*self).ok()
    }
}

impl ToKeycode for str {
    fn to_keycode(&self) -> Option<Keycode> {
        self.trim().parse().ok()
    }
}

impl ToKeycode for String {
    fn to_keycode(&self) -> Option<Keycode> {
        self.as_str().to_keycode()
    }
}

/// Result of reading a preset file into a [`Mapping`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Entries were replaced; `skipped` entries had a bad keycode or character
    Loaded { skipped: usize },
    /// No file at the preset path, mapping untouched
    NotFound,
    /// Unreadable file or no `mapping` object, mapping untouched
    Malformed,
}

/// Keycode → character table with dirty tracking
///
/// Each keycode is unique, several keycodes may map to the same character.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    entries: BTreeMap<Keycode, Character>,
    /// Set by every mutation, cleared by load and save
    pub changed: bool,
    /// Top-level preset keys other than `mapping`, kept across load/save
    metadata: Map<String, Value>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Iterate over (keycode, character) pairs in ascending keycode order
    pub fn iter(&self) -> impl Iterator<Item = (Keycode, &Character)> {
        self.entries.iter().map(|(keycode, character)| (*keycode, character))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace the mapping of a keycode with a different one
    ///
    /// `previous_keycode` is the keycode the edited row represented before.
    /// When it differs from `new_keycode` its entry is removed, since that row
    /// now stands for a different key.
    ///
    /// Returns true on success. Non-numeric keycodes, keycode 0 and empty
    /// characters leave the mapping untouched and return false.
    pub fn change<K: ToKeycode + ?Sized>(
        &mut self,
        new_keycode: &K,
        character: impl Into<Character>,
        previous_keycode: Option<&K>,
    ) -> bool {
        let Some(new_keycode) = new_keycode.to_keycode() else {
            error!("Can only use numbers as keycodes");
            return false;
        };
        let previous_keycode = match previous_keycode.map(|keycode| keycode.to_keycode()) {
            Some(None) => {
                error!("Can only use numbers as keycodes");
                return false;
            }
            Some(Some(keycode)) => Some(keycode),
            None => None,
        };

        let character = character.into();
        if new_keycode == 0 || character.is_empty() {
            return false;
        }

        self.entries.insert(new_keycode, character);
        if let Some(previous) = previous_keycode {
            if previous != new_keycode {
                self.clear(previous);
            }
        }
        self.changed = true;
        true
    }

    /// Remove a keycode from the mapping
    pub fn clear(&mut self, keycode: Keycode) {
        if self.entries.remove(&keycode).is_some() {
            self.changed = true;
        }
    }

    /// Remove all mappings
    pub fn empty(&mut self) {
        self.entries.clear();
        self.changed = true;
    }

    pub fn get_character(&self, keycode: Keycode) -> Option<&Character> {
        self.entries.get(&keycode)
    }

    /// Lowest keycode whose character is or contains `symbol`
    pub fn get_keycode(&self, symbol: &str) -> Option<Keycode> {
        self.entries
            .iter()
            .find(|(_, character)| character.contains(symbol))
            .map(|(keycode, _)| *keycode)
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Attach a metadata value that is written next to the mapping table
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if key == MAPPING_KEY {
            warn!("Refusing to store metadata under the reserved key \"{MAPPING_KEY}\"");
            return;
        }
        self.metadata.insert(key, value);
        self.changed = true;
    }

    /// Load a preset of a device, replacing the current entries
    pub fn load(&mut self, store: &PresetStore, device: &str, preset: &str) -> LoadOutcome {
        self.load_path(&store.preset_path(device, preset))
    }

    /// Read a dumped JSON file, replacing the current entries
    ///
    /// The mapping is only touched if the file has a `mapping` object.
    /// Entries with a non-integer keycode or an unusable character are
    /// skipped individually.
    pub fn load_path(&mut self, path: &Path) -> LoadOutcome {
        info!(path = %path.display(), "Loading preset");

        if !path.exists() {
            error!(path = %path.display(), "Tried to load non-existing preset");
            return LoadOutcome::NotFound;
        }

        let preset: Map<String, Value> = match fs::read_to_string(path)
            .context("Failed to read preset")
            .and_then(|contents| {
                serde_json::from_str(&contents).context("Failed to parse preset JSON")
            }) {
            Ok(preset) => preset,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Invalid preset config");
                return LoadOutcome::Malformed;
            }
        };

        let Some(Value::Object(table)) = preset.get(MAPPING_KEY) else {
            error!(path = %path.display(), "Invalid preset config, no \"{MAPPING_KEY}\" object");
            return LoadOutcome::Malformed;
        };

        let mut entries = BTreeMap::new();
        let mut skipped = 0;
        for (key, value) in table {
            let Some(keycode) = key.to_keycode() else {
                warn!(keycode = %key, "Found non-int keycode");
                skipped += 1;
                continue;
            };
            match serde_json::from_value::<Character>(value.clone()) {
                Ok(character) if !character.is_empty() => {
                    entries.insert(keycode, character);
                }
                _ => {
                    warn!(keycode, value = %value, "Found invalid character");
                    skipped += 1;
                }
            }
        }

        self.metadata = preset
            .into_iter()
            .filter(|(key, _)| key != MAPPING_KEY)
            .collect();
        self.entries = entries;
        self.changed = false;

        LoadOutcome::Loaded { skipped }
    }

    /// Save the mapping as a preset of a device
    pub fn save(&mut self, store: &PresetStore, device: &str, preset: &str) -> Result<()> {
        if !presets::is_valid_name(preset) {
            bail!("Invalid preset name {preset:?}");
        }
        self.save_path(&store.preset_path(device, preset))
    }

    /// Dump as pretty printed JSON, creating parent directories as needed
    pub fn save_path(&mut self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "Saving preset");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create preset directory {:?}", parent))?;
        }

        // keep the table in its own key so metadata can live next to it
        let mut preset = Map::new();
        preset.insert(
            MAPPING_KEY.to_string(),
            serde_json::to_value(&self.entries).context("Failed to serialize mapping")?,
        );
        for (key, value) in &self.metadata {
            preset.insert(key.clone(), value.clone());
        }

        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        preset
            .serialize(&mut serializer)
            .context("Failed to serialize preset to JSON")?;
        buf.push(b'\n');

        fs::write(path, buf).with_context(|| format!("Failed to write preset to {:?}", path))?;

        self.changed = false;
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Mapping {
    type Item = (Keycode, &'a Character);
    type IntoIter = Box<dyn Iterator<Item = (Keycode, &'a Character)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn character(symbol: &str) -> Character {
        Character::from(symbol)
    }

    #[test]
    fn test_change_adds_entry() {
        let mut mapping = Mapping::new();
        assert!(mapping.change(&10, "a", None));
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.get_character(10), Some(&character("a")));
        assert!(mapping.changed);

        assert!(mapping.change(&11, "b", None));
        assert_eq!(mapping.len(), 2);
    }

    #[test]
    fn test_change_accepts_numeric_text() {
        let mut mapping = Mapping::new();
        assert!(mapping.change("12", "c", Some(" 13 ")));
        assert_eq!(mapping.get_character(12), Some(&character("c")));
    }

    #[test]
    fn test_change_rejects_non_integer_keycode() {
        let mut mapping = Mapping::new();
        mapping.change(&10, "a", None);
        mapping.changed = false;

        assert!(!mapping.change("a", "b", None));
        assert!(!mapping.change("12", "b", Some("foo")));
        assert!(!mapping.change(&-5, "b", None));

        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.get_character(12), None);
        assert!(!mapping.changed);
    }

    #[test]
    fn test_change_rejects_empty_values() {
        let mut mapping = Mapping::new();
        assert!(!mapping.change(&0, "a", None));
        assert!(!mapping.change(&10, "", None));
        assert!(!mapping.change(&10, Vec::<String>::new(), None));
        assert!(mapping.is_empty());
        assert!(!mapping.changed);
    }

    #[test]
    fn test_change_removes_previous_keycode() {
        let mut mapping = Mapping::new();
        mapping.change(&10, "a", None);
        assert!(mapping.change(&11, "a", Some(&10)));

        assert_eq!(mapping.get_character(10), None);
        assert_eq!(mapping.get_character(11), Some(&character("a")));
        assert_eq!(mapping.len(), 1);
    }

    #[test]
    fn test_change_same_previous_keycode_overwrites() {
        let mut mapping = Mapping::new();
        mapping.change(&10, "a", None);
        assert!(mapping.change(&10, "b", Some(&10)));
        assert_eq!(mapping.get_character(10), Some(&character("b")));
        assert_eq!(mapping.len(), 1);
    }

    #[test]
    fn test_clear_and_empty() {
        let mut mapping = Mapping::new();
        mapping.change(&10, "a", None);
        mapping.change(&11, "b", None);
        mapping.changed = false;

        mapping.clear(99);
        assert!(!mapping.changed);

        mapping.clear(10);
        assert!(mapping.changed);
        assert_eq!(mapping.get_character(10), None);
        assert_eq!(mapping.len(), 1);

        mapping.changed = false;
        mapping.empty();
        assert!(mapping.changed);
        assert!(mapping.is_empty());
    }

    #[test]
    fn test_iter_sorted_by_keycode() {
        let mut mapping = Mapping::new();
        mapping.change(&30, "c", None);
        mapping.change(&10, "a", None);
        mapping.change(&20, "b", None);

        let keycodes: Vec<Keycode> = mapping.iter().map(|(k, _)| k).collect();
        assert_eq!(keycodes, vec![10, 20, 30]);
        assert_eq!((&mapping).into_iter().count(), 3);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut mapping = Mapping::new();
        mapping.change(&10, "a", None);

        let mut clone = mapping.clone();
        assert!(clone.changed);
        clone.change(&10, "b", None);
        clone.change(&11, "c", None);

        assert_eq!(mapping.get_character(10), Some(&character("a")));
        assert_eq!(mapping.len(), 1);
        assert_eq!(clone.len(), 2);
    }

    #[test]
    fn test_get_keycode() {
        let mut mapping = Mapping::new();
        mapping.change(&38, vec!["a", "A"], None);
        mapping.change(&56, "b", None);
        mapping.change(&90, vec!["a"], None);

        assert_eq!(mapping.get_keycode("A"), Some(38));
        assert_eq!(mapping.get_keycode("a"), Some(38));
        assert_eq!(mapping.get_keycode("b"), Some(56));
        assert_eq!(mapping.get_keycode("z"), None);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("device 1").join("preset.json");

        let mut mapping = Mapping::new();
        mapping.change(&10, "a", None);
        mapping.change(&11, vec!["b", "B"], None);
        mapping.change(&120, "KP_1", None);
        mapping.set_metadata("author", Value::from("me"));
        mapping.save_path(&path).unwrap();
        assert!(!mapping.changed);

        let mut loaded = Mapping::new();
        loaded.changed = true;
        assert_eq!(loaded.load_path(&path), LoadOutcome::Loaded { skipped: 0 });
        assert!(!loaded.changed);

        let expected: Vec<_> = mapping.iter().collect();
        let actual: Vec<_> = loaded.iter().collect();
        assert_eq!(actual, expected);
        assert_eq!(loaded.metadata().get("author"), Some(&Value::from("me")));
    }

    #[test]
    fn test_save_file_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("preset.json");

        let mut mapping = Mapping::new();
        mapping.change(&10, "a", None);
        mapping.save_path(&path).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.ends_with("}\n"));
        assert!(contents.contains("    \"mapping\": {"));
        assert!(contents.contains("        \"10\": \"a\""));
    }

    #[test]
    fn test_save_rejects_names_outside_device_dir() {
        let dir = TempDir::new().unwrap();
        let store = PresetStore::new(dir.path());

        let mut mapping = Mapping::new();
        mapping.change(&10, "a", None);
        assert!(mapping.save(&store, "device 1", "../device 2/evil").is_err());
        assert!(mapping.save(&store, "device 1", "..").is_err());
        assert!(mapping.changed);
        assert!(!dir.path().join("device 2").exists());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let mut mapping = Mapping::new();
        mapping.change(&10, "a", None);

        let outcome = mapping.load_path(&dir.path().join("nope.json"));
        assert_eq!(outcome, LoadOutcome::NotFound);
        assert_eq!(mapping.len(), 1);
        assert!(mapping.changed);
    }

    #[test]
    fn test_load_without_mapping_key_keeps_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{\"foo\": {\"10\": \"a\"}}\n").unwrap();

        let mut mapping = Mapping::new();
        mapping.change(&20, "x", None);

        assert_eq!(mapping.load_path(&path), LoadOutcome::Malformed);
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.get_character(20), Some(&character("x")));
        assert!(mapping.metadata().is_empty());
    }

    #[test]
    fn test_load_invalid_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{\"mapping\": ").unwrap();

        let mut mapping = Mapping::new();
        assert_eq!(mapping.load_path(&path), LoadOutcome::Malformed);
    }

    #[test]
    fn test_load_skips_bad_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.json");
        fs::write(
            &path,
            r#"{"mapping": {"10": "a", "foo": "b", "11": 5, "12": ["c", "C"], "13": ""}, "version": 2}"#,
        )
        .unwrap();

        let mut mapping = Mapping::new();
        assert_eq!(mapping.load_path(&path), LoadOutcome::Loaded { skipped: 3 });
        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping.get_character(10), Some(&character("a")));
        assert_eq!(
            mapping.get_character(12),
            Some(&Character::from(vec!["c", "C"]))
        );
        assert_eq!(mapping.metadata().get("version"), Some(&Value::from(2)));
    }

    #[test]
    fn test_set_metadata_refuses_mapping_key() {
        let mut mapping = Mapping::new();
        mapping.set_metadata("mapping", Value::Null);
        assert!(mapping.metadata().is_empty());
        assert!(!mapping.changed);
    }
}
