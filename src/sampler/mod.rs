use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::Local;

use crate::core::output::OutputLine;
use crate::core::process::{ProcessExit, ProcessSupervisor, StopOutcome};
use crate::core::types::{Pid, RunOutcome, RunRequest, SamplingError};
use crate::storage::{self, SamplingRecord};

pub mod settings;

pub use self::settings::{EventSpec, SamplingSettings};

/// How many times in a row a run may be retried with force lock.
pub const MAX_FORCE_LOCK_RETRIES: u32 = 3;

/// What wperf prints on stderr when another process holds the driver.
pub const LOCK_CONTENTION_SIGNATURE: &str = "other WindowsPerf process acquired the wperf-driver";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    /// A run is in flight; another may not start.
    pub fn is_busy(self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Running)
    }
}

/// Sent once at the end of every run that got past `start_run`.
#[derive(Debug)]
pub enum SessionEvent {
    RunCompleted {
        outcome: RunOutcome,
        /// The parsed output, for successful runs.
        record: Option<SamplingRecord>,
        label: String,
    },
    RunFailed(SamplingError),
}

/// Drives wperf runs one at a time and reports how each one ended on the event channel returned
/// by `new`.
pub struct SamplingSession {
    supervisor: Arc<ProcessSupervisor>,
    state: Arc<Mutex<SessionState>>,
    cancelled: Arc<AtomicBool>,
    force_lock_retries: Arc<AtomicU32>,
    events: Sender<SessionEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SamplingSession {
    pub fn new() -> (Self, Receiver<SessionEvent>) {
        SamplingSession::with_supervisor(ProcessSupervisor::default())
    }

    pub fn with_supervisor(supervisor: ProcessSupervisor) -> (Self, Receiver<SessionEvent>) {
        let (events, receiver) = channel();
        let session = SamplingSession {
            supervisor: Arc::new(supervisor),
            state: Arc::new(Mutex::new(SessionState::Idle)),
            cancelled: Arc::new(AtomicBool::new(false)),
            force_lock_retries: Arc::new(AtomicU32::new(0)),
            events,
            worker: Mutex::new(None),
        };
        (session, receiver)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    /// Lines of profiler output, as they're printed, for every run started from now on.
    pub fn subscribe_output(&self) -> Receiver<OutputLine> {
        self.supervisor.subscribe()
    }

    /// Starts a run and returns as soon as wperf has been spawned. How it ends arrives later as
    /// a `SessionEvent`.
    pub fn start_run(&self, settings: &SamplingSettings) -> Result<Pid, SamplingError> {
        let request = self.begin(settings, Attempt::Fresh)?;
        self.spawn_run(&request, settings)
    }

    /// Re-issues a run that failed with `DriverLockContention`, telling wperf to take the
    /// driver lock. Gives up with `RetryLimitExceeded` after `MAX_FORCE_LOCK_RETRIES` attempts
    /// in a row.
    pub fn retry_with_force_lock(&self, settings: &SamplingSettings) -> Result<Pid, SamplingError> {
        let mut settings = settings.clone();
        settings.force_lock = true;
        let request = self.begin(&settings, Attempt::ForceLockRetry)?;
        self.spawn_run(&request, &settings)
    }

    /// Asks the running profiler to stop. It gets the supervisor's grace period to finish before
    /// it's killed. The run then ends as `Cancelled`.
    pub fn cancel_run(&self) -> Result<StopOutcome, SamplingError> {
        {
            let state = self.state.lock().unwrap();
            if !state.is_busy() {
                return Ok(StopOutcome::NotRunning);
            }
            self.cancelled.store(true, Ordering::SeqCst);
        }
        // Before the spawn this finds nothing to stop; the worker picks up the flag instead.
        self.supervisor.stop(false)
    }

    /// Claims the session for a new run. Nothing changes unless the claim succeeds.
    fn begin(&self, settings: &SamplingSettings, attempt: Attempt) -> Result<RunRequest, SamplingError> {
        let request = settings.to_run_request()?;
        let mut state = self.state.lock().unwrap();
        if state.is_busy() {
            return Err(SamplingError::AlreadyRunning);
        }
        match attempt {
            Attempt::Fresh => self.force_lock_retries.store(0, Ordering::SeqCst),
            Attempt::ForceLockRetry => {
                let retries = self.force_lock_retries.load(Ordering::SeqCst) + 1;
                if retries > MAX_FORCE_LOCK_RETRIES {
                    return Err(SamplingError::RetryLimitExceeded(MAX_FORCE_LOCK_RETRIES));
                }
                info!("Retrying with force lock, attempt {} of {}", retries, MAX_FORCE_LOCK_RETRIES);
                self.force_lock_retries.store(retries, Ordering::SeqCst);
            }
        }
        self.cancelled.store(false, Ordering::SeqCst);
        *state = SessionState::Starting;
        Ok(request)
    }

    fn spawn_run(&self, request: &RunRequest, settings: &SamplingSettings) -> Result<Pid, SamplingError> {
        // The previous worker has already published its result
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }

        let pid = match self.supervisor.start(request) {
            Ok(pid) => pid,
            Err(e) => {
                *self.state.lock().unwrap() = SessionState::Failed;
                return Err(e);
            }
        };
        *self.state.lock().unwrap() = SessionState::Running;

        let supervisor = self.supervisor.clone();
        let state = self.state.clone();
        let cancelled = self.cancelled.clone();
        let force_lock_retries = self.force_lock_retries.clone();
        let events = self.events.clone();
        let settings = settings.clone();
        let worker = std::thread::Builder::new()
            .name("sampling-session".to_string())
            .spawn(move || {
                if cancelled.load(Ordering::SeqCst) {
                    debug!("Run {} was cancelled while starting", pid);
                    if let Err(e) = supervisor.stop(false) {
                        warn!("Failed to stop profiler process {}: {}", pid, e);
                    }
                }
                let exit = supervisor.wait();
                let (next, event) = finish_run(exit, cancelled.load(Ordering::SeqCst), &settings);
                if !matches!(event, SessionEvent::RunFailed(SamplingError::DriverLockContention { .. })) {
                    force_lock_retries.store(0, Ordering::SeqCst);
                }
                *state.lock().unwrap() = next;
                if events.send(event).is_err() {
                    debug!("Nobody is listening for the end of run {}", pid);
                }
            });
        match worker {
            Ok(worker) => {
                *self.worker.lock().unwrap() = Some(worker);
                Ok(pid)
            }
            Err(e) => {
                error!("Couldn't start session worker: {}", e);
                let _ = self.supervisor.stop(true);
                let _ = self.supervisor.wait();
                *self.state.lock().unwrap() = SessionState::Failed;
                Err(e.into())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Fresh,
    ForceLockRetry,
}

impl Drop for SamplingSession {
    fn drop(&mut self) {
        if let Err(e) = self.supervisor.stop(true) {
            debug!("Failed to stop profiler: {}", e);
        }
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

/// Decides how a run ended from its exit status and output. The lock contention signature wins
/// over the exit status, and cancellation wins over everything.
pub(crate) fn classify_exit(
    success: bool,
    stdout: String,
    stderr: String,
    cancelled: bool,
) -> Result<RunOutcome, SamplingError> {
    if cancelled {
        return Ok(RunOutcome::Cancelled);
    }
    if stderr.contains(LOCK_CONTENTION_SIGNATURE) {
        info!("wperf driver is locked by another process");
        return Err(SamplingError::DriverLockContention { stderr });
    }
    if !success {
        return Ok(RunOutcome::Failure(stderr));
    }
    if stdout.trim().is_empty() {
        return Err(SamplingError::EmptyOutput);
    }
    Ok(RunOutcome::Success(stdout))
}

fn finish_run(
    exit: Result<ProcessExit, SamplingError>,
    cancelled: bool,
    settings: &SamplingSettings,
) -> (SessionState, SessionEvent) {
    let outcome = exit.and_then(|exit| classify_exit(exit.success, exit.stdout, exit.stderr, cancelled));
    let completed = |outcome: RunOutcome, record: Option<SamplingRecord>| {
        let feature_name = record.as_ref().and_then(|r| r.kind.feature_name());
        let label = settings.label(feature_name, Local::now());
        SessionEvent::RunCompleted {
            outcome,
            record,
            label,
        }
    };
    match outcome {
        Ok(RunOutcome::Success(stdout)) => match storage::parse(&stdout) {
            Ok(record) => (SessionState::Completed, completed(RunOutcome::Success(stdout), Some(record))),
            Err(e) => (SessionState::Failed, SessionEvent::RunFailed(e)),
        },
        Ok(RunOutcome::Failure(stderr)) => {
            warn!("wperf failed: {}", stderr.trim());
            (SessionState::Failed, completed(RunOutcome::Failure(stderr), None))
        }
        Ok(RunOutcome::Cancelled) => (SessionState::Cancelled, completed(RunOutcome::Cancelled, None)),
        Err(e) => (SessionState::Failed, SessionEvent::RunFailed(e)),
    }
}
