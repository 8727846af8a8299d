//! The injection loop shared by thread and process workers

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::constants::input::EV_SYN;
use crate::constants::injection::POLL_TIMEOUT_MS;
use crate::injection::table::{KeyEvent, KeyTable};

/// Where a worker reads raw events from
pub trait EventSource: Send {
    /// Events in the order they were read, waiting at most `timeout`
    ///
    /// An empty batch means nothing arrived in time, `None` means the source
    /// closed (device unplugged, script exhausted).
    fn next_batch(&mut self, timeout: Duration) -> Result<Option<Vec<KeyEvent>>>;
}

/// Where a worker writes rewritten events to
pub trait EventSink: Send {
    fn emit(&mut self, events: &[KeyEvent]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The stop flag was raised
    Stopped,
    /// The source has no more events
    SourceClosed,
}

/// Read, translate and emit events until stopped or the source closes
///
/// Events are emitted one by one in the order received. The stop flag is
/// checked before every event, so nothing is emitted after it is observed.
/// `relay` sees every emitted event and must not block.
pub fn run(
    source: &mut dyn EventSource,
    sink: &mut dyn EventSink,
    table: &KeyTable,
    stop: &AtomicBool,
    mut relay: impl FnMut(KeyEvent),
) -> Result<WorkerExit> {
    info!(mapped_keys = table.len(), "Injection started");
    let timeout = Duration::from_millis(u64::from(POLL_TIMEOUT_MS));

    loop {
        if stop.load(Ordering::SeqCst) {
            info!("Injection stopped");
            return Ok(WorkerExit::Stopped);
        }

        let Some(batch) = source.next_batch(timeout).context("Failed to read events")? else {
            info!("Event source closed");
            return Ok(WorkerExit::SourceClosed);
        };

        for event in batch {
            if stop.load(Ordering::SeqCst) {
                info!("Injection stopped");
                return Ok(WorkerExit::Stopped);
            }
            // the output device writes its own sync reports
            if event.kind == EV_SYN {
                continue;
            }

            let event = table.translate(event);
            debug!(code = event.code, value = event.value, "Emitting");
            sink.emit(std::slice::from_ref(&event))
                .context("Failed to emit event")?;
            relay(event);
        }
    }
}
