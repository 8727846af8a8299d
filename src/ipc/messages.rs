//! IPC message types for controller ↔ injector process communication

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::injection::table::{KeyEvent, KeyTable};

/// Requests sent from the controller to an injector process
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum InjectorRequest {
    /// Grab the device's event nodes and start rewriting with `table`
    Start {
        device: String,
        paths: Vec<PathBuf>,
        table: KeyTable,
        /// Report every emitted event back
        relay: bool,
    },
}

/// Responses sent from an injector process to the controller
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum InjectorResponse {
    /// Devices are open, injection is running
    Ready,

    /// An event was written to the virtual device (only with relay enabled)
    Emitted(KeyEvent),

    /// Startup failed, the process exits
    Error(String),

    /// Injection ended, the process exits
    Stopped,
}
