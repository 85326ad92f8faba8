//! Run orchestration - reactor lifecycle, kill policy, result assembly
//!
//! The runner owns everything a run allocates: the reactor, the parsed
//! descriptor, every stdio pipe and the kill timer. It is single-use; a
//! fresh instance is constructed for every spawn and consumed by `run`.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::RunOptions;
use crate::error::io_errno;
use crate::pipe::{CaptureBudget, Lifecycle as PipeLifecycle, PipeEvent, StdioPipe};
use crate::spawn::{build_command, parse_options};

/// Coarse phase of the runner, used to gate teardown ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Lifecycle {
    Uninitialized,
    Initialized,
    HandlesClosed,
}

/// How the child ended, once it ran at all.
#[derive(Debug, Clone, Copy)]
struct ChildExit {
    code: Option<i32>,
    signal: Option<Signal>,
}

/// Aggregate result of one synchronous run.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// First recorded fatal error, if any; pipe I/O errors are reported
    /// only when nothing more serious happened
    pub error: Option<Errno>,
    /// Exit code; `None` if the child never started or was terminated by a
    /// signal
    pub status: Option<i32>,
    /// Terminating signal, if there was one
    pub signal: Option<Signal>,
    /// Child process id, when the spawn succeeded
    pub pid: Option<u32>,
    /// Captured bytes per child fd; `None` if the child never started, and
    /// `None` per slot that was not a captured pipe
    pub output: Option<Vec<Option<Vec<u8>>>>,
}

impl RunResult {
    /// True when no error was recorded and the child exited with code 0.
    pub fn success(&self) -> bool {
        self.error.is_none() && self.status == Some(0)
    }

    /// Captured child stdout (fd 1), when it was a captured pipe.
    pub fn stdout(&self) -> Option<&[u8]> {
        self.stream(1)
    }

    /// Captured child stderr (fd 2), when it was a captured pipe.
    pub fn stderr(&self) -> Option<&[u8]> {
        self.stream(2)
    }

    /// Name of the terminating signal, e.g. `"SIGTERM"`.
    pub fn signal_name(&self) -> Option<&'static str> {
        self.signal.map(Signal::as_str)
    }

    fn stream(&self, fd: usize) -> Option<&[u8]> {
        self.output.as_ref()?.get(fd)?.as_deref()
    }
}

/// Single-use orchestrator for one child process run.
pub(crate) struct Runner {
    options: RunOptions,
    pipes: Vec<Option<StdioPipe>>,
    pid: Option<Pid>,
    killed: bool,
    timer_armed: bool,
    buffered_output_size: usize,
    timeout: Option<Duration>,
    max_buffer: Option<u32>,
    kill_signal: Signal,
    exited: bool,
    exit: Option<ChildExit>,
    error: Option<Errno>,
    pipe_error: Option<Errno>,
    lifecycle: Lifecycle,
}

impl Runner {
    pub(crate) fn new(options: RunOptions) -> Self {
        Self {
            options,
            pipes: Vec::new(),
            pid: None,
            killed: false,
            timer_armed: false,
            buffered_output_size: 0,
            timeout: None,
            max_buffer: None,
            kill_signal: Signal::SIGTERM,
            exited: false,
            exit: None,
            error: None,
            pipe_error: None,
            lifecycle: Lifecycle::Uninitialized,
        }
    }

    /// Spawn the child, drive its I/O to completion and assemble the
    /// result. Blocks the calling thread; every handle allocated along the
    /// way is closed before this returns.
    pub(crate) fn run(mut self) -> RunResult {
        debug_assert_eq!(self.lifecycle, Lifecycle::Uninitialized);
        self.lifecycle = Lifecycle::Initialized;

        // A fresh reactor per run, never shared with the caller.
        match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(reactor) => {
                reactor.block_on(self.spawn_and_run());
                self.close_handles();
                // The reactor outlives every handle; dropped last.
                drop(reactor);
            }
            Err(err) => {
                warn!(error = %err, "failed to build reactor");
                self.set_error(io_errno(&err));
                self.close_handles();
            }
        }

        self.build_result()
    }

    /// Everything between reactor creation and teardown. Any failure
    /// records an error and returns; teardown runs unconditionally
    /// afterwards.
    async fn spawn_and_run(&mut self) {
        let spec = match parse_options(&self.options, &mut self.pipes) {
            Ok(spec) => spec,
            Err(err) => {
                warn!(error = %err, "option parsing failed");
                return self.set_error(err.errno());
            }
        };
        self.timeout = spec.timeout;
        self.max_buffer = spec.max_buffer;
        self.kill_signal = spec.kill_signal;

        // The kill timer starts before the spawn. While the child runs it
        // can fire but never keeps the loop alive by itself; if the spawn
        // fails below it is torn down before it could ever fire.
        let kill_timer = tokio::time::sleep(self.timeout.unwrap_or(Duration::ZERO));
        tokio::pin!(kill_timer);
        self.timer_armed = self.timeout.is_some();

        let (mut command, extra_fds) = match build_command(&spec, &mut self.pipes) {
            Ok(built) => built,
            Err(err) => {
                warn!(error = %err, "building the spawn descriptor failed");
                return self.set_error(err.errno());
            }
        };

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(file = %self.options.file, error = %err, "spawn failed");
                drop(command);
                drop(extra_fds);
                return self.set_error(io_errno(&err));
            }
        };
        // The descriptor holds the child end of every pipe; both must go
        // away now or the parent ends never see EOF.
        drop(command);
        drop(extra_fds);

        self.pid = child.id().map(|pid| Pid::from_raw(pid as i32));
        debug!(pid = ?self.pid, file = %self.options.file, "child spawned");

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let budget = self
            .max_buffer
            .map(|cap| std::sync::Arc::new(CaptureBudget::new(cap as usize)));

        let mut drivers = JoinSet::new();
        for (child_fd, slot) in self.pipes.iter_mut().enumerate() {
            if let Some(pipe) = slot.take() {
                let events = event_tx.clone();
                let budget = budget.clone();
                drivers.spawn(async move { (child_fd, pipe.drive(events, budget).await) });
            }
        }
        drop(event_tx);

        // Drive the reactor until the child has exited and every pipe
        // driver has handed its pipe back.
        let mut events_open = true;
        while !self.exited || !drivers.is_empty() {
            tokio::select! {
                status = child.wait(), if !self.exited => {
                    self.exited = true;
                    self.on_exit(status);
                }
                () = &mut kill_timer, if self.timer_armed => {
                    self.on_kill_timer();
                }
                event = event_rx.recv(), if events_open => match event {
                    Some(event) => self.on_pipe_event(event),
                    None => events_open = false,
                },
                joined = drivers.join_next(), if !drivers.is_empty() => {
                    match joined {
                        Some(Ok((child_fd, pipe))) => self.pipes[child_fd] = Some(pipe),
                        Some(Err(err)) => {
                            warn!(error = %err, "stdio pipe driver failed");
                            self.set_pipe_error(Errno::EIO);
                        }
                        None => {}
                    }
                }
            }
        }

        // Late pipe errors may still sit in the channel.
        while let Ok(event) = event_rx.try_recv() {
            self.on_pipe_event(event);
        }

        // If we get here the child exited, or setup failed before it ran.
        debug_assert!(self.exit.is_some() || self.error.is_some());
    }

    /// Close every handle that is still open, then mark the runner torn
    /// down. Runs even after setup errors; pipes that came back Closed
    /// from their drivers are left alone.
    fn close_handles(&mut self) {
        debug_assert!(self.lifecycle < Lifecycle::HandlesClosed);
        self.lifecycle = Lifecycle::HandlesClosed;

        for pipe in self.pipes.iter_mut().flatten() {
            if matches!(
                pipe.lifecycle(),
                PipeLifecycle::Initialized | PipeLifecycle::Started
            ) {
                pipe.close();
            }
        }
    }

    fn on_exit(&mut self, status: io::Result<ExitStatus>) {
        match status {
            Ok(status) => {
                let code = status.code();
                let term_signal = status
                    .signal()
                    .and_then(|signo| Signal::try_from(signo).ok());
                debug!(code = ?code, signal = ?term_signal, "child exited");
                self.exit = Some(ChildExit {
                    code,
                    signal: term_signal,
                });
            }
            Err(err) => {
                warn!(error = %err, "collecting the child exit failed");
                self.set_error(io_errno(&err));
            }
        }
        self.stop_kill_timer();
    }

    fn on_kill_timer(&mut self) {
        info!(
            timeout_ms = self.timeout.map(|t| t.as_millis() as u64),
            "timeout elapsed, killing child"
        );
        self.set_error(Errno::ETIMEDOUT);
        self.kill();
    }

    fn on_pipe_event(&mut self, event: PipeEvent) {
        match event {
            PipeEvent::Data(n) => self.on_output_increment(n),
            PipeEvent::Error(errno) => self.set_pipe_error(errno),
        }
    }

    /// Account committed output; past the cap the child is killed. The
    /// pipe drivers stop committing on their own via the shared budget, so
    /// no dedicated error code is recorded here and the caller observes a
    /// signaled exit.
    fn on_output_increment(&mut self, n: usize) {
        self.buffered_output_size += n;
        if let Some(cap) = self.max_buffer {
            if self.buffered_output_size > cap as usize {
                warn!(
                    buffered = self.buffered_output_size,
                    cap, "output cap exceeded, killing child"
                );
                self.kill();
            }
        }
    }

    /// Send the kill signal to the child, at most once. A send failure
    /// other than "no such process" is recorded and answered with exactly
    /// one SIGKILL.
    fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;

        if let Some(pid) = self.pid {
            debug!(pid = %pid, signal = %self.kill_signal, "killing child");
            if let Err(errno) = signal::kill(pid, self.kill_signal) {
                if errno != Errno::ESRCH {
                    warn!(pid = %pid, error = %errno, "kill failed, escalating to SIGKILL");
                    self.set_error(errno);
                    let _ = signal::kill(pid, Signal::SIGKILL);
                }
            }
        }

        self.stop_kill_timer();
    }

    fn stop_kill_timer(&mut self) {
        self.timer_armed = false;
    }

    fn set_error(&mut self, errno: Errno) {
        if self.error.is_none() {
            self.error = Some(errno);
        }
    }

    fn set_pipe_error(&mut self, errno: Errno) {
        if self.pipe_error.is_none() {
            self.pipe_error = Some(errno);
        }
    }

    fn get_error(&self) -> Option<Errno> {
        self.error.or(self.pipe_error)
    }

    fn build_result(&self) -> RunResult {
        debug_assert_eq!(self.lifecycle, Lifecycle::HandlesClosed);

        let started = self.exit.is_some();
        let output = started.then(|| {
            self.pipes
                .iter()
                .map(|slot| {
                    slot.as_ref()
                        .filter(|pipe| pipe.writable())
                        .map(StdioPipe::output_bytes)
                })
                .collect()
        });

        RunResult {
            error: self.get_error(),
            status: self.exit.and_then(|exit| exit.code),
            signal: self.exit.and_then(|exit| exit.signal),
            pid: self.pid.map(|pid| pid.as_raw() as u32),
            output,
        }
    }
}
