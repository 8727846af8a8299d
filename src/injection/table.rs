//! Input events and the code translation table a worker applies

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::constants::input::{EV_KEY, XKB_KEYCODE_OFFSET};
use crate::mapping::{Keycode, Mapping};

/// A raw input event as read from or written to an evdev node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    /// evdev event type (`EV_KEY`, `EV_SYN`, ...)
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

impl KeyEvent {
    pub fn key(code: u16, value: i32) -> Self {
        Self {
            kind: EV_KEY,
            code,
            value,
        }
    }
}

/// evdev code → evdev code
///
/// Built once when a session starts. Running workers only ever see this
/// snapshot, later edits of the mappings need a new session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyTable {
    codes: BTreeMap<u16, u16>,
}

/// X keycode to evdev code, `None` below the xkb offset
fn to_evdev(keycode: Keycode) -> Option<u16> {
    keycode
        .checked_sub(XKB_KEYCODE_OFFSET)
        .and_then(|code| u16::try_from(code).ok())
}

impl KeyTable {
    /// Resolve the custom mapping's symbols against the system layout
    ///
    /// Entries whose symbol doesn't exist in the system layout are skipped,
    /// those keys keep their original meaning.
    pub fn from_mappings(custom: &Mapping, system: &Mapping) -> Self {
        let mut codes = BTreeMap::new();
        for (keycode, character) in custom.iter() {
            let Some(symbol) = character.primary() else {
                continue;
            };
            let Some(target) = system.get_keycode(symbol) else {
                warn!(keycode, symbol = %symbol, "Symbol not in system layout, key is passed through");
                continue;
            };
            match (to_evdev(keycode), to_evdev(target)) {
                (Some(from), Some(to)) => {
                    debug!(from, to, symbol = %symbol, "Mapping key");
                    codes.insert(from, to);
                }
                _ => warn!(keycode, target, "Keycode outside the evdev range, skipping"),
            }
        }
        Self { codes }
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn get(&self, code: u16) -> Option<u16> {
        self.codes.get(&code).copied()
    }

    /// Rewrite a key event, anything else passes through unchanged
    pub fn translate(&self, event: KeyEvent) -> KeyEvent {
        if event.kind != EV_KEY {
            return event;
        }
        match self.get(event.code) {
            Some(code) => KeyEvent { code, ..event },
            None => event,
        }
    }
}
