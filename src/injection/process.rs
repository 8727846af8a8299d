//! Workers running in their own process
//!
//! The controller re-executes itself with the hidden injector subcommand.
//! The start request goes over the child's stdin, responses and relayed
//! events come back over its stdout. Stopping is SIGTERM, then SIGKILL if
//! the worker doesn't exit in time.

use anyhow::{Context, Result, anyhow, bail};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::constants::injection::WORKER_SUBCOMMAND;
use crate::devices::{EvdevSink, EvdevSource};
use crate::injection::table::KeyEvent;
use crate::injection::worker::{self, WorkerExit};
use crate::injection::{LaunchRequest, Launcher, Session};
use crate::ipc::{InjectorRequest, InjectorResponse, read_message, write_message};

/// How often a stopping controller checks whether the worker exited
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    relay: bool,
    relay_capacity: usize,
    start_timeout: Duration,
    log_level: String,
}

impl ProcessLauncher {
    /// Launch workers from the running executable
    pub fn new(relay: bool, relay_capacity: usize, start_timeout: Duration, log_level: &str) -> Result<Self> {
        let program = std::env::current_exe().context("Failed to resolve executable path")?;
        Ok(Self {
            program,
            args: vec![WORKER_SUBCOMMAND.to_string()],
            relay,
            relay_capacity,
            start_timeout,
            log_level: log_level.to_string(),
        })
    }
}

/// Startup outcome the reader thread hands back
enum Handshake {
    Ready,
    Failed(String),
}

impl Launcher for ProcessLauncher {
    fn launch(&self, request: LaunchRequest) -> Result<Box<dyn Session>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("LOG_LEVEL", &self.log_level)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .context("Failed to spawn injector process")?;
        let pid = child.id();
        info!(pid, device = %request.device, "Spawned injector process");

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            reap(&mut child);
            bail!("Injector process has no stdio pipes");
        };

        let start = InjectorRequest::Start {
            device: request.device.clone(),
            paths: request.paths,
            table: request.table,
            relay: self.relay,
        };
        let mut writer = BufWriter::new(stdin);
        if let Err(e) = write_message(&mut writer, &start) {
            reap(&mut child);
            return Err(e).context("Failed to send start request to injector");
        }
        // the worker only reads one request
        drop(writer);

        let (handshake_tx, handshake_rx) = mpsc::channel();
        let (relay_tx, relay_rx) = mpsc::sync_channel(self.relay_capacity);
        let device = request.device.clone();
        let spawned = thread::Builder::new()
            .name(format!("injector {device} reader"))
            .spawn(move || read_responses(stdout, handshake_tx, relay_tx, &device));
        let reader = match spawned {
            Ok(reader) => reader,
            Err(e) => {
                reap(&mut child);
                return Err(e).context("Failed to spawn injector reader thread");
            }
        };

        let failure = match handshake_rx.recv_timeout(self.start_timeout) {
            Ok(Handshake::Ready) => None,
            Ok(Handshake::Failed(message)) => Some(anyhow!("Injector failed to start: {message}")),
            Err(RecvTimeoutError::Timeout) => Some(anyhow!(
                "Injector did not start within {:?}",
                self.start_timeout
            )),
            Err(RecvTimeoutError::Disconnected) => Some(anyhow!("Injector exited during startup")),
        };
        if let Some(e) = failure {
            reap(&mut child);
            let _ = reader.join();
            return Err(e);
        }

        info!(pid, device = %request.device, "Injector process ready");
        Ok(Box::new(ProcessSession {
            child,
            reader: Some(reader),
            relay: Some(relay_rx),
        }))
    }
}

/// Drain the worker's stdout until it closes
///
/// Always reading keeps the worker from blocking on a full pipe.
fn read_responses<R: Read>(
    stdout: R,
    handshake: mpsc::Sender<Handshake>,
    relay: SyncSender<KeyEvent>,
    device: &str,
) {
    let mut stdout = BufReader::new(stdout);
    loop {
        let response = match read_message::<_, InjectorResponse>(&mut stdout) {
            Ok(Some(response)) => response,
            Ok(None) => break,
            Err(e) => {
                error!(device = %device, error = %e, "Failed to read from injector");
                break;
            }
        };

        match response {
            InjectorResponse::Ready => {
                let _ = handshake.send(Handshake::Ready);
            }
            InjectorResponse::Error(message) => {
                error!(device = %device, error = %message, "Injector reported an error");
                let _ = handshake.send(Handshake::Failed(message));
            }
            InjectorResponse::Emitted(event) => {
                // full or abandoned relay drops the event
                let _ = relay.try_send(event);
            }
            InjectorResponse::Stopped => {
                debug!(device = %device, "Injector acknowledged stop");
            }
        }
    }
    debug!(device = %device, "Injector output closed");
}

/// Kill a child that never became a session
fn reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!(error = %e, "Failed to kill injector process");
    }
    let _ = child.wait();
}

struct ProcessSession {
    child: Child,
    reader: Option<JoinHandle<()>>,
    relay: Option<Receiver<KeyEvent>>,
}

impl ProcessSession {
    fn terminate(&self) -> Result<()> {
        let pid = i32::try_from(self.child.id()).context("Process id out of range")?;
        kill(Pid::from_raw(pid), Signal::SIGTERM).context("Failed to send SIGTERM to injector")
    }
}

impl Session for ProcessSession {
    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn take_relay(&mut self) -> Option<Receiver<KeyEvent>> {
        self.relay.take()
    }

    fn stop(&mut self, timeout: Duration) -> Result<()> {
        let pid = self.child.id();
        let deadline = Instant::now() + timeout;

        let mut result = Ok(());
        if self.is_running() {
            info!(pid, "Stopping injector process");
            self.terminate()?;

            let exited = loop {
                match self.child.try_wait() {
                    Ok(Some(status)) => {
                        debug!(pid, exit = ?status.code(), "Injector exited");
                        break true;
                    }
                    Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL_INTERVAL),
                    Ok(None) => break false,
                    Err(e) => {
                        warn!(pid, error = %e, "Failed to query injector status");
                        break false;
                    }
                }
            };

            if !exited {
                warn!(pid, "Injector ignored SIGTERM, killing");
                let _ = self.child.kill();
                self.child
                    .wait()
                    .context("Failed to wait for injector exit")?;
                result = Err(anyhow!("Injector did not stop within {timeout:?}"));
            }
        }

        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        result
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        if self.is_running() {
            reap(&mut self.child);
        }
    }
}

/// Entry point of the injector process
///
/// Reads one start request from stdin, injects until SIGTERM/SIGINT or the
/// device goes away, and reports on stdout.
pub fn run_injector_process() -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop))
        .context("Failed to register SIGTERM handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))
        .context("Failed to register SIGINT handler")?;

    let mut stdin = std::io::stdin().lock();
    let Some(InjectorRequest::Start {
        device,
        paths,
        table,
        relay,
    }) = read_message::<_, InjectorRequest>(&mut stdin)?
    else {
        bail!("No start request on stdin");
    };
    let mut stdout = std::io::stdout().lock();

    let opened = EvdevSource::open(&paths).and_then(|source| Ok((source, EvdevSink::create()?)));
    let (mut source, mut sink) = match opened {
        Ok(pair) => pair,
        Err(e) => {
            error!(device = %device, error = %e, "Failed to open devices");
            write_message(&mut stdout, &InjectorResponse::Error(format!("{e:#}")))?;
            return Err(e);
        }
    };
    write_message(&mut stdout, &InjectorResponse::Ready)?;
    info!(device = %device, pid = std::process::id(), "Injector running");

    let exit = worker::run(&mut source, &mut sink, &table, &stop, |event| {
        if relay {
            // the controller may be gone already
            let _ = write_message(&mut stdout, &InjectorResponse::Emitted(event));
        }
    })?;
    match exit {
        WorkerExit::Stopped => info!(device = %device, "Injector stopping"),
        WorkerExit::SourceClosed => warn!(device = %device, "Input closed, injector exiting"),
    }

    // grabs are released before the acknowledgement
    drop(source);
    drop(sink);
    let _ = write_message(&mut stdout, &InjectorResponse::Stopped);
    stdout.flush().context("Failed to flush stdout")?;
    Ok(())
}
