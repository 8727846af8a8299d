//! IPC (Inter-Process Communication) with injector processes
//!
//! Messages travel over the worker's stdin/stdout pipes as length-prefixed
//! JSON. Shutdown is requested with SIGTERM, not with a message.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};

mod messages;
pub use messages::{InjectorRequest, InjectorResponse};

/// Maximum message size (10 MB) to prevent DoS via memory exhaustion
const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Write length-prefixed message to stream
pub fn write_message<W: Write, T: Serialize>(stream: &mut W, msg: &T) -> Result<()> {
    let json = serde_json::to_vec(msg).context("Failed to serialize message to JSON")?;

    // Write length prefix (u32 little-endian)
    let len = u32::try_from(json.len()).context("Message too large for length prefix")?;
    stream
        .write_all(&len.to_le_bytes())
        .context("Failed to write message length")?;

    // Write JSON payload
    stream
        .write_all(&json)
        .context("Failed to write message payload")?;

    stream.flush().context("Failed to flush stream")?;

    Ok(())
}

/// Read length-prefixed message from stream
///
/// `None` if the stream ended cleanly before a new message.
pub fn read_message<R: Read, T: for<'de> Deserialize<'de>>(stream: &mut R) -> Result<Option<T>> {
    // Read length prefix
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("Failed to read message length"),
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    // Sanity check (prevent DoS via huge allocation)
    if len > MAX_MESSAGE_SIZE {
        return Err(anyhow!("Message too large: {} bytes (max: {})", len, MAX_MESSAGE_SIZE));
    }

    // Read JSON payload
    let mut json_buf = vec![0u8; len];
    stream
        .read_exact(&mut json_buf)
        .context("Failed to read message payload")?;

    // Deserialize
    serde_json::from_slice(&json_buf)
        .map(Some)
        .context("Failed to deserialize message from JSON")
}
