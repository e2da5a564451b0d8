use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::Receiver;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::core::output::{OutputLine, OutputStream, StreamKind, Subscribers};
use crate::core::types::{Pid, RunRequest, SamplingError};

/// How long a graceful stop waits for the profiler to exit before killing it.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(2000);

// The OS reports exit immediately; this only bounds how stale `is_running` and `wait` can be.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Exit status and complete output of a profiler process that has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessExit {
    fn new(status: ExitStatus, stdout: String, stderr: String) -> Self {
        ProcessExit {
            success: status.success(),
            code: status.code(),
            stdout,
            stderr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// There was nothing to stop: no process, or it had already exited.
    NotRunning,
    /// The process exited within the grace period after being interrupted.
    Interrupted,
    /// The process was forcibly terminated.
    Killed,
}

/// The live child and everything attached to it. Owned by exactly one supervisor.
struct ChildProcessHandle {
    child: Child,
    pid: Pid,
    // Held open so the profiler doesn't see EOF on stdin while it's recording.
    stdin: Option<ChildStdin>,
    stdout: Option<OutputStream>,
    stderr: Option<OutputStream>,
}

/// Owns at most one running profiler process. Starting, waiting and stopping may happen from
/// different threads; stops are serialized.
pub struct ProcessSupervisor {
    handle: Mutex<Option<ChildProcessHandle>>,
    stop_lock: Mutex<()>,
    subscribers: Subscribers,
    grace_period: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        ProcessSupervisor::new(DEFAULT_GRACE_PERIOD)
    }
}

impl ProcessSupervisor {
    pub fn new(grace_period: Duration) -> Self {
        ProcessSupervisor {
            handle: Mutex::new(None),
            stop_lock: Mutex::new(()),
            subscribers: Subscribers::default(),
            grace_period,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Returns a receiver for every stdout and stderr line of every process this supervisor
    /// starts from now on.
    pub fn subscribe(&self) -> Receiver<OutputLine> {
        self.subscribers.subscribe()
    }

    /// Spawns the profiler with all three standard streams piped and no console window.
    ///
    /// Fails with `AlreadyRunning` if a previous process hasn't been reaped by `wait` yet, and
    /// with `Spawn` if the executable can't be started. A CPU affinity that can't be applied is
    /// logged and otherwise ignored.
    pub fn start(&self, request: &RunRequest) -> Result<Pid, SamplingError> {
        let mut slot = self.lock_handle();
        if slot.is_some() {
            return Err(SamplingError::AlreadyRunning);
        }

        let mut command = Command::new(&request.program);
        command
            .args(request.command_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        platform::configure(&mut command);

        let mut child = command.spawn().map_err(|source| SamplingError::Spawn {
            program: request.program.clone(),
            source,
        })?;
        let pid = child.id();
        info!("Started profiler process {}: {}", pid, request);

        if let Some(mask) = request.cpu_affinity {
            match platform::set_affinity(&child, mask) {
                Ok(()) => debug!("Set CPU affinity of process {} to {:#x}", pid, mask),
                Err(e) => warn!("Couldn't set CPU affinity {:#x} on process {}: {}", mask, pid, e),
            }
        }

        let stdout = match child.stdout.take() {
            Some(pipe) => Some(OutputStream::capture(StreamKind::Stdout, pipe, self.subscribers.clone())),
            None => None,
        };
        let stderr = match child.stderr.take() {
            Some(pipe) => Some(OutputStream::capture(StreamKind::Stderr, pipe, self.subscribers.clone())),
            None => None,
        };
        let (stdout, stderr) = match (stdout.transpose(), stderr.transpose()) {
            (Ok(stdout), Ok(stderr)) => (stdout, stderr),
            (Err(e), _) | (_, Err(e)) => {
                // Without readers the pipes would fill up and stall the profiler
                error!("Couldn't start output readers for process {}: {}", pid, e);
                platform::kill(&mut child);
                let _ = child.wait();
                return Err(e.into());
            }
        };

        *slot = Some(ChildProcessHandle {
            stdin: child.stdin.take(),
            child,
            pid,
            stdout,
            stderr,
        });
        Ok(pid)
    }

    pub fn pid(&self) -> Option<Pid> {
        self.lock_handle().as_ref().map(|handle| handle.pid)
    }

    /// True while a process has been started and hasn't exited yet.
    pub fn is_running(&self) -> bool {
        let mut slot = self.lock_handle();
        match slot.as_mut() {
            Some(handle) => matches!(handle.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Blocks until the current process exits, then releases it and returns its status and
    /// complete output. After this returns, `start` may be called again.
    pub fn wait(&self) -> Result<ProcessExit, SamplingError> {
        let (status, handle) = loop {
            {
                let mut slot = self.lock_handle();
                let status = match slot.as_mut() {
                    Some(handle) => handle.child.try_wait()?,
                    None => return Err(SamplingError::NoActiveProcess),
                };
                if let Some(status) = status {
                    if let Some(handle) = slot.take() {
                        break (status, handle);
                    }
                }
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        };

        debug!("Profiler process {} exited with {}", handle.pid, status);
        drop(handle.stdin);
        let stdout = match handle.stdout {
            Some(stream) => stream.finish()?,
            None => String::new(),
        };
        let stderr = match handle.stderr {
            Some(stream) => stream.finish()?,
            None => String::new(),
        };
        Ok(ProcessExit::new(status, stdout, stderr))
    }

    /// Stops the current process.
    ///
    /// Without `force`, the process group gets an interrupt first and has the grace period to
    /// exit on its own; if it's still alive after that it's killed. With `force` it's killed
    /// straight away. Stopping a process that has already exited does nothing.
    pub fn stop(&self, force: bool) -> Result<StopOutcome, SamplingError> {
        let _serialized = self.stop_lock.lock().unwrap();

        let pid = {
            let mut slot = self.lock_handle();
            match slot.as_mut() {
                None => return Ok(StopOutcome::NotRunning),
                Some(handle) => {
                    if handle.child.try_wait()?.is_some() {
                        return Ok(StopOutcome::NotRunning);
                    }
                    handle.pid
                }
            }
        };

        if !force {
            match platform::interrupt(pid) {
                Ok(_interrupted) => {
                    info!("Sent interrupt to profiler process {}", pid);
                    let deadline = Instant::now() + self.grace_period;
                    while Instant::now() < deadline {
                        if self.has_exited()? {
                            return Ok(StopOutcome::Interrupted);
                        }
                        std::thread::sleep(EXIT_POLL_INTERVAL);
                    }
                    warn!(
                        "Profiler process {} still running {}ms after interrupt, terminating it",
                        pid,
                        self.grace_period.as_millis()
                    );
                }
                Err(e) => warn!("Couldn't interrupt profiler process {}: {}, terminating it", pid, e),
            }
        }

        self.kill()
    }

    fn has_exited(&self) -> Result<bool, SamplingError> {
        let mut slot = self.lock_handle();
        Ok(match slot.as_mut() {
            Some(handle) => handle.child.try_wait()?.is_some(),
            None => true,
        })
    }

    fn kill(&self) -> Result<StopOutcome, SamplingError> {
        let mut slot = self.lock_handle();
        match slot.as_mut() {
            None => Ok(StopOutcome::NotRunning),
            Some(handle) => {
                if handle.child.try_wait()?.is_some() {
                    return Ok(StopOutcome::NotRunning);
                }
                platform::kill(&mut handle.child);
                // Reap now; the status stays cached for `wait`.
                handle.child.wait()?;
                info!("Terminated profiler process {}", handle.pid);
                Ok(StopOutcome::Killed)
            }
        }
    }

    fn lock_handle(&self) -> MutexGuard<'_, Option<ChildProcessHandle>> {
        self.handle.lock().unwrap()
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        let slot = match self.handle.get_mut() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = slot.as_mut() {
            if let Ok(None) = handle.child.try_wait() {
                warn!("Supervisor dropped while profiler process {} was running, killing it", handle.pid);
                platform::kill(&mut handle.child);
                if let Err(e) = handle.child.wait() {
                    debug!("Failed to wait for process {}: {:?}", handle.pid, e);
                }
            }
        }
    }
}

#[cfg(unix)]
mod platform {
    use std::io;
    use std::os::unix::process::CommandExt;
    use std::process::{Child, Command};

    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid as NixPid;

    use crate::core::types::Pid;

    pub struct InterruptGuard;

    pub fn configure(command: &mut Command) {
        // A group of its own: the interrupt reaches wperf and its helpers, and a Ctrl+C typed at
        // our terminal doesn't.
        command.process_group(0);
    }

    pub fn interrupt(pid: Pid) -> io::Result<InterruptGuard> {
        killpg(NixPid::from_raw(pid as i32), Signal::SIGINT)?;
        Ok(InterruptGuard)
    }

    pub fn kill(child: &mut Child) {
        if let Err(e) = killpg(NixPid::from_raw(child.id() as i32), Signal::SIGKILL) {
            debug!("Failed to kill process group {}: {}", child.id(), e);
            if let Err(e) = child.kill() {
                debug!("Failed to kill process {}: {:?}", child.id(), e);
            }
        }
    }

    #[cfg(target_os = "linux")]
    pub fn set_affinity(child: &Child, mask: u64) -> io::Result<()> {
        if mask == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty CPU mask"));
        }
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            for cpu in 0..64usize {
                if mask & (1u64 << cpu) != 0 {
                    libc::CPU_SET(cpu, &mut set);
                }
            }
            let size = std::mem::size_of::<libc::cpu_set_t>();
            if libc::sched_setaffinity(child.id() as libc::pid_t, size, &set) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn set_affinity(_child: &Child, _mask: u64) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "CPU affinity isn't supported on this platform",
        ))
    }
}

#[cfg(windows)]
mod platform {
    use std::io;
    use std::os::windows::io::AsRawHandle;
    use std::os::windows::process::CommandExt;
    use std::process::{Child, Command};
    use std::sync::{Mutex, MutexGuard};

    use winapi::shared::minwindef::{FALSE, TRUE};
    use winapi::um::consoleapi::SetConsoleCtrlHandler;
    use winapi::um::winbase::{SetProcessAffinityMask, CREATE_NO_WINDOW};
    use winapi::um::wincon::{
        AttachConsole, FreeConsole, GenerateConsoleCtrlEvent, ATTACH_PARENT_PROCESS, CTRL_C_EVENT,
    };
    use winapi::um::winnt::HANDLE;

    use crate::core::types::Pid;

    // A process has one console, so attaching to the child's is a process-wide affair.
    static CONSOLE: Mutex<()> = Mutex::new(());

    /// Keeps our Ctrl+C handling disabled while the interrupted child shuts down, then hands us
    /// back our own console.
    pub struct InterruptGuard {
        _console: MutexGuard<'static, ()>,
    }

    impl Drop for InterruptGuard {
        fn drop(&mut self) {
            unsafe {
                AttachConsole(ATTACH_PARENT_PROCESS);
                SetConsoleCtrlHandler(None, FALSE);
            }
        }
    }

    pub fn configure(command: &mut Command) {
        command.creation_flags(CREATE_NO_WINDOW);
    }

    pub fn interrupt(pid: Pid) -> io::Result<InterruptGuard> {
        let console = CONSOLE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        unsafe {
            FreeConsole();
            if AttachConsole(pid) == 0 {
                let err = io::Error::last_os_error();
                AttachConsole(ATTACH_PARENT_PROCESS);
                return Err(err);
            }
            SetConsoleCtrlHandler(None, TRUE);
            let sent = GenerateConsoleCtrlEvent(CTRL_C_EVENT, 0);
            let err = io::Error::last_os_error();
            FreeConsole();
            if sent == 0 {
                AttachConsole(ATTACH_PARENT_PROCESS);
                SetConsoleCtrlHandler(None, FALSE);
                return Err(err);
            }
        }
        Ok(InterruptGuard { _console: console })
    }

    pub fn kill(child: &mut Child) {
        if let Err(e) = child.kill() {
            debug!("Failed to kill process {}: {:?}", child.id(), e);
        }
    }

    pub fn set_affinity(child: &Child, mask: u64) -> io::Result<()> {
        let ok = unsafe { SetProcessAffinityMask(child.as_raw_handle() as HANDLE, mask as usize) };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn shell(script: &str) -> RunRequest {
        RunRequest::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn spawn_failure_is_reported_synchronously() {
        let supervisor = ProcessSupervisor::default();
        let request = RunRequest::new("/definitely/not/a/real/wperf", vec![]);
        match supervisor.start(&request) {
            Err(SamplingError::Spawn { program, .. }) => {
                assert_eq!(program, request.program)
            }
            other => panic!("expected a spawn error, got {:?}", other),
        }
        assert!(!supervisor.is_running());
        assert_eq!(supervisor.pid(), None);
    }

    #[cfg(unix)]
    #[test]
    fn collects_output_and_exit_status() {
        let supervisor = ProcessSupervisor::default();
        let lines = supervisor.subscribe();
        supervisor
            .start(&shell("echo one; echo two; echo oops >&2; exit 3"))
            .expect("failed to start");

        let exit = supervisor.wait().expect("failed to wait");
        assert!(!exit.success);
        assert_eq!(exit.code, Some(3));
        assert_eq!(exit.stdout, "one\ntwo\n");
        assert_eq!(exit.stderr, "oops\n");

        let received: Vec<OutputLine> = lines.try_iter().collect();
        let stdout: Vec<&str> = received
            .iter()
            .filter(|l| l.stream == StreamKind::Stdout)
            .map(|l| l.text.as_str())
            .collect();
        assert_eq!(stdout, vec!["one", "two"]);
        assert!(received
            .iter()
            .any(|l| l.stream == StreamKind::Stderr && l.text == "oops"));

        // The slot is free again once the process has been reaped
        assert!(matches!(supervisor.wait(), Err(SamplingError::NoActiveProcess)));
    }

    #[cfg(unix)]
    #[test]
    fn second_start_is_rejected_while_running() {
        let supervisor = ProcessSupervisor::default();
        let pid = supervisor.start(&shell("exec sleep 30")).expect("failed to start");

        match supervisor.start(&shell("echo nope")) {
            Err(SamplingError::AlreadyRunning) => {}
            other => panic!("expected AlreadyRunning, got {:?}", other),
        }
        assert!(supervisor.is_running());
        assert_eq!(supervisor.pid(), Some(pid));

        assert_eq!(supervisor.stop(true).expect("stop failed"), StopOutcome::Killed);
        supervisor.wait().expect("failed to wait");
    }

    #[cfg(unix)]
    #[test]
    fn graceful_stop_interrupts_cooperative_process() {
        let supervisor = ProcessSupervisor::default();
        supervisor
            .start(&shell("trap 'echo interrupted; exit 0' INT; while true; do sleep 0.05; done"))
            .expect("failed to start");
        // Give the shell a moment to install its trap
        std::thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        assert_eq!(supervisor.stop(false).expect("stop failed"), StopOutcome::Interrupted);
        assert!(started.elapsed() < DEFAULT_GRACE_PERIOD);

        let exit = supervisor.wait().expect("failed to wait");
        assert!(exit.stdout.contains("interrupted"));
    }

    #[cfg(unix)]
    #[test]
    fn graceful_stop_escalates_after_grace_period() {
        let supervisor = ProcessSupervisor::default();
        supervisor
            .start(&shell("trap '' INT; exec sleep 30"))
            .expect("failed to start");
        std::thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        assert_eq!(supervisor.stop(false).expect("stop failed"), StopOutcome::Killed);
        let elapsed = started.elapsed();
        assert!(elapsed >= DEFAULT_GRACE_PERIOD, "killed too early: {:?}", elapsed);
        assert!(
            elapsed <= DEFAULT_GRACE_PERIOD + Duration::from_millis(500),
            "killed too late: {:?}",
            elapsed
        );

        let exit = supervisor.wait().expect("failed to wait");
        assert!(!exit.success);
    }

    #[cfg(unix)]
    #[test]
    fn concurrent_stops_are_serialized() {
        let supervisor = ProcessSupervisor::new(Duration::from_millis(200));
        supervisor
            .start(&shell("trap '' INT; exec sleep 30"))
            .expect("failed to start");
        std::thread::sleep(Duration::from_millis(200));

        let supervisor = &supervisor;
        let mut outcomes: Vec<StopOutcome> = std::thread::scope(|scope| {
            let stops: Vec<_> = (0..2)
                .map(|_| scope.spawn(move || supervisor.stop(false).expect("stop failed")))
                .collect();
            stops
                .into_iter()
                .map(|stop| stop.join().expect("stop panicked"))
                .collect()
        });
        outcomes.sort_by_key(|outcome| *outcome == StopOutcome::Killed);
        assert_eq!(outcomes, vec![StopOutcome::NotRunning, StopOutcome::Killed]);
        assert!(!supervisor.wait().expect("failed to wait").success);
    }

    #[cfg(unix)]
    #[test]
    fn stop_is_idempotent() {
        let supervisor = ProcessSupervisor::new(Duration::from_millis(100));
        assert_eq!(supervisor.stop(false).expect("stop failed"), StopOutcome::NotRunning);

        supervisor.start(&shell("exit 0")).expect("failed to start");
        while supervisor.is_running() {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(supervisor.stop(false).expect("stop failed"), StopOutcome::NotRunning);
        assert_eq!(supervisor.stop(true).expect("stop failed"), StopOutcome::NotRunning);
        assert!(supervisor.wait().expect("failed to wait").success);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn bad_affinity_does_not_fail_the_start() {
        let supervisor = ProcessSupervisor::default();
        let mut request = shell("echo ok");
        request.cpu_affinity = Some(0);
        supervisor.start(&request).expect("affinity failure should not be fatal");
        let exit = supervisor.wait().expect("failed to wait");
        assert_eq!(exit.stdout, "ok\n");
    }

    #[cfg(unix)]
    #[test]
    fn dropping_the_supervisor_kills_the_process() {
        let supervisor = ProcessSupervisor::default();
        let pid = supervisor.start(&shell("exec sleep 30")).expect("failed to start");
        drop(supervisor);

        // kill(pid, 0) fails with ESRCH once the process is gone and reaped
        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok();
        assert!(!alive, "process {} outlived its supervisor", pid);
    }
}
