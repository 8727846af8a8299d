//! Application-wide constants
//!
//! This module contains the magic numbers and string literals used throughout
//! the application, providing a single source of truth for constant values.

/// Input event constants (from evdev)
pub mod input {
    /// `EV_SYN` event type
    pub const EV_SYN: u16 = 0x00;

    /// `EV_KEY` event type
    pub const EV_KEY: u16 = 0x01;

    /// Key press event value
    pub const KEY_PRESS: i32 = 1;

    /// Key release event value
    pub const KEY_RELEASE: i32 = 0;

    /// Highest key code the virtual output device advertises (`KEY_MAX`)
    pub const KEY_MAX: u16 = 0x2ff;

    /// X keycodes are evdev codes shifted by this amount
    pub const XKB_KEYCODE_OFFSET: u32 = 8;
}

/// Filesystem paths
pub mod paths {
    /// Input device directory
    pub const DEV_INPUT: &str = "/dev/input";

    /// Event node file name prefix inside [`DEV_INPUT`]
    pub const EVENT_NODE_PREFIX: &str = "event";
}

/// Permission-related constants
pub mod permissions {
    /// Group required for reading /dev/input and writing /dev/uinput
    pub const INPUT_GROUP: &str = "input";

    /// Command hint for adding the current user to the input group
    pub const ADD_TO_INPUT_GROUP: &str = "sudo usermod -aG input $USER";
}

/// Configuration layout
pub mod config {
    /// Directory below the XDG config dir
    pub const APP_DIR: &str = "key-mapper";

    /// Application settings file inside [`APP_DIR`]
    pub const FILENAME: &str = "config.json";

    /// Directory holding one subdirectory of presets per device
    pub const PRESETS_DIR: &str = "presets";

    /// Extension of preset files
    pub const PRESET_EXTENSION: &str = "json";

    /// Name proposed for freshly created presets
    pub const DEFAULT_PRESET_NAME: &str = "new preset";
}

/// Injection worker timing and sizing
pub mod injection {
    /// How long the worker blocks in poll(2) before re-checking the stop flag
    pub const POLL_TIMEOUT_MS: u16 = 100;

    /// Default wait for the worker's Ready handshake
    pub const START_TIMEOUT_MS: u64 = 2000;

    /// Default wait for the worker to acknowledge a stop request
    pub const STOP_TIMEOUT_MS: u64 = 2000;

    /// Default number of relayed events buffered before new ones are dropped
    pub const RELAY_CAPACITY: usize = 1024;

    /// Name of the uinput device the worker emits to
    pub const VIRTUAL_DEVICE_NAME: &str = "key-mapper";

    /// Hidden subcommand that runs the worker process
    pub const WORKER_SUBCOMMAND: &str = "injector";
}
