//! Workers running on a thread of the current process

use anyhow::{Context, Result, bail};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::injection::table::KeyEvent;
use crate::injection::worker::{self, EventSink, EventSource, WorkerExit};
use crate::injection::{LaunchRequest, Launcher, Session};

/// Opens the source and sink for a launch request
pub type Opener =
    dyn Fn(&LaunchRequest) -> Result<(Box<dyn EventSource>, Box<dyn EventSink>)> + Send + Sync;

pub struct ThreadLauncher {
    opener: Box<Opener>,
    relay_capacity: usize,
}

impl ThreadLauncher {
    pub fn new(opener: Box<Opener>, relay_capacity: usize) -> Self {
        Self {
            opener,
            relay_capacity,
        }
    }
}

impl Launcher for ThreadLauncher {
    fn launch(&self, request: LaunchRequest) -> Result<Box<dyn Session>> {
        // open synchronously so failures surface from apply()
        let (mut source, mut sink) = (self.opener)(&request)
            .with_context(|| format!("Failed to open devices of {:?}", request.device))?;

        let stop = Arc::new(AtomicBool::new(false));
        let (relay_tx, relay_rx) = mpsc::sync_channel(self.relay_capacity);
        // never sent on, the worker dropping it is the exit acknowledgement
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let device = request.device.clone();
        let table = request.table;
        let worker_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(format!("injector {device}"))
            .spawn(move || {
                let _done = done_tx;
                let result = worker::run(source.as_mut(), sink.as_mut(), &table, &worker_stop, |event| {
                    // full or abandoned relay drops the event
                    let _ = relay_tx.try_send(event);
                });
                match result {
                    Ok(WorkerExit::Stopped) => info!(device = %device, "Injection thread stopped"),
                    Ok(WorkerExit::SourceClosed) => warn!(device = %device, "Input closed, injection thread exiting"),
                    Err(e) => error!(device = %device, error = %e, "Injection thread failed"),
                }
            })
            .context("Failed to spawn injection thread")?;

        info!(device = %request.device, "Started injection thread");
        Ok(Box::new(ThreadSession {
            stop,
            done: done_rx,
            handle: Some(handle),
            relay: Some(relay_rx),
        }))
    }
}

struct ThreadSession {
    stop: Arc<AtomicBool>,
    done: Receiver<()>,
    handle: Option<thread::JoinHandle<()>>,
    relay: Option<Receiver<KeyEvent>>,
}

impl Session for ThreadSession {
    fn is_running(&mut self) -> bool {
        matches!(self.done.try_recv(), Err(TryRecvError::Empty))
    }

    fn take_relay(&mut self) -> Option<Receiver<KeyEvent>> {
        self.relay.take()
    }

    fn stop(&mut self, timeout: Duration) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);

        if let Err(RecvTimeoutError::Timeout) = self.done.recv_timeout(timeout) {
            bail!("Injection thread did not stop within {:?}", timeout);
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Injection thread panicked");
            }
        }
        Ok(())
    }
}

impl Drop for ThreadSession {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}
