//! Runs restic and streams its progress as typed events.
//!
//! A run moves through `NotStarted → Running → Draining → Terminated`. Stdout and
//! stderr are pumped by separate tasks into one queue, so each stream stays in
//! order but the interleaving between them is whatever the OS delivered first.
//! Every run ends with exactly one terminal event, after which the channel closes.

pub mod message;
pub mod outcome;
pub mod progress;

pub use message::{decode_line, BackupMessage, MessageKind};
pub use outcome::{OutcomeTracker, RunOutcome};

use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the event channel; a full channel blocks the reader
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// How long a cancelled child may take to exit before it is killed
const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Longer output lines are split into chunks of this size
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Exit code reported for cancelled runs (128 + SIGINT)
pub const CANCELLED_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running,
    Draining,
    Terminated,
}

/// Consumer side of a run
#[derive(Debug)]
pub struct RunHandle {
    events: mpsc::Receiver<BackupMessage>,
    state: watch::Receiver<RunState>,
    cancel: CancellationToken,
}

impl RunHandle {
    /// Next event, `None` once the run has terminated
    pub async fn recv(&mut self) -> Option<BackupMessage> {
        self.events.recv().await
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Ask the child to stop; the run still ends with one terminal event
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drain the run and report how it ended
    pub async fn wait(self) -> RunOutcome {
        self.wait_with(|_| {}).await
    }

    /// Drain the run, handing every event to `on_event` first
    pub async fn wait_with(mut self, mut on_event: impl FnMut(&BackupMessage)) -> RunOutcome {
        let mut tracker = OutcomeTracker::new();
        while let Some(msg) = self.events.recv().await {
            on_event(&msg);
            tracker.observe(&msg);
        }
        tracker.finish()
    }
}

impl Drop for RunHandle {
    /// Nobody is listening any more, so stop the child
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawn `command` and start streaming its output.
///
/// Must be called from within a tokio runtime. The command should have piped
/// stdout and stderr (see [`crate::command::build`]).
pub fn spawn_run(command: Command) -> RunHandle {
    let (events_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (state_tx, state) = watch::channel(RunState::NotStarted);
    let cancel = CancellationToken::new();

    tokio::spawn(drive(command, events_tx, state_tx, cancel.clone()));

    RunHandle {
        events,
        state,
        cancel,
    }
}

/// Forwards events and keeps the one-terminal-event rule
struct Emitter {
    events: mpsc::Sender<BackupMessage>,
    terminal_seen: bool,
    open: bool,
}

impl Emitter {
    fn new(events: mpsc::Sender<BackupMessage>) -> Self {
        Self {
            events,
            terminal_seen: false,
            open: true,
        }
    }

    /// Returns false once the receiver is gone
    async fn emit(&mut self, mut msg: BackupMessage) -> bool {
        if msg.is_terminal() {
            if self.terminal_seen {
                debug!(kind = ?msg.message_type, "Demoting surplus terminal event");
                msg.demote();
            } else {
                self.terminal_seen = true;
            }
        }

        if self.open && self.events.send(msg).await.is_err() {
            warn!("Event receiver dropped, cancelling run");
            self.open = false;
        }
        self.open
    }

    async fn finish(&mut self, msg: BackupMessage) {
        if !self.terminal_seen {
            self.emit(msg).await;
        }
    }
}

/// Cancellation progress of one child
struct Stopper {
    requested: bool,
    killed: bool,
    deadline: Instant,
}

impl Stopper {
    fn new() -> Self {
        Self {
            requested: false,
            killed: false,
            deadline: Instant::now(),
        }
    }

    fn request(&mut self, child: &mut Child) {
        self.requested = true;
        self.deadline = Instant::now() + CANCEL_GRACE;
        if !interrupt(child) {
            self.kill(child);
        }
    }

    fn kill(&mut self, child: &mut Child) {
        self.killed = true;
        if let Err(e) = child.start_kill() {
            debug!(error = %e, "Kill failed, child probably exited already");
        }
    }

    fn waiting_for_exit(&self) -> bool {
        self.requested && !self.killed
    }
}

async fn drive(
    mut command: Command,
    events: mpsc::Sender<BackupMessage>,
    state: watch::Sender<RunState>,
    cancel: CancellationToken,
) {
    let mut emitter = Emitter::new(events);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!(error = %e, "Failed to launch restic");
            emitter
                .emit(BackupMessage::error(1, format!("failed to launch restic: {e}")))
                .await;
            state.send_replace(RunState::Terminated);
            return;
        }
    };
    state.send_replace(RunState::Running);
    debug!(pid = ?child.id(), "Restic started");

    let (line_tx, mut lines) = mpsc::channel::<String>(EVENT_CHANNEL_CAPACITY);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump_lines(stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump_lines(stderr, line_tx.clone()));
    }
    drop(line_tx);

    let mut stopper = Stopper::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled(), if !stopper.requested => {
                info!("Cancelling restic run");
                stopper.request(&mut child);
            }
            _ = tokio::time::sleep_until(stopper.deadline), if stopper.waiting_for_exit() => {
                warn!("Restic ignored the interrupt, killing it");
                stopper.kill(&mut child);
            }
            line = lines.recv() => match line {
                Some(line) => {
                    if !emitter.emit(decode_line(&line)).await {
                        cancel.cancel();
                        stopper.requested = true;
                        stopper.kill(&mut child);
                        break;
                    }
                }
                None => break,
            }
        }
    }

    state.send_replace(RunState::Draining);
    drop(lines);

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = cancel.cancelled(), if !stopper.requested => {
                info!("Cancelling restic run");
                stopper.request(&mut child);
            }
            _ = tokio::time::sleep_until(stopper.deadline), if stopper.waiting_for_exit() => {
                warn!("Restic ignored the interrupt, killing it");
                stopper.kill(&mut child);
            }
        }
    };

    emitter.finish(final_event(status, stopper.requested)).await;
    state.send_replace(RunState::Terminated);
}

fn final_event(status: std::io::Result<ExitStatus>, cancelled: bool) -> BackupMessage {
    match status {
        _ if cancelled => BackupMessage::error(CANCELLED_CODE, "run cancelled"),
        Ok(status) if status.success() => BackupMessage::done(),
        Ok(status) => {
            debug!(%status, "Restic exited unsuccessfully");
            BackupMessage::error(1, format!("restic exited with {status}"))
        }
        Err(e) => {
            error!(error = %e, "Failed to wait for restic");
            BackupMessage::error(1, format!("failed to wait for restic: {e}"))
        }
    }
}

/// Read newline-delimited output into the line queue, splitting lines longer
/// than [`MAX_LINE_BYTES`]
async fn pump_lines<R>(reader: R, lines: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(512);

    loop {
        buf.clear();
        let mut limited = (&mut reader).take(MAX_LINE_BYTES as u64);
        match limited.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim();
                if line.is_empty() {
                    continue;
                }
                if lines.send(line.to_string()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to read restic output");
                break;
            }
        }
    }
}

/// Send SIGINT so restic can release its repository lock. Returns false if
/// the signal could not be delivered.
#[cfg(unix)]
fn interrupt(child: &mut Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };
    match i32::try_from(pid) {
        Ok(pid) => kill(Pid::from_raw(pid), Signal::SIGINT).is_ok(),
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn interrupt(_child: &mut Child) -> bool {
    false
}
