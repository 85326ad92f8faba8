//! Option parsing and spawn-descriptor construction
//!
//! `parse_options` validates the caller record and copies every string into
//! owned, null-terminated storage; nothing in the descriptor aliases caller
//! memory. Numeric fields must fit their native types; violations are hard
//! EINVAL errors, never truncation. `build_command` then turns the parsed
//! descriptor plus the initialized pipes into a ready-to-spawn command.

use std::ffi::{CString, OsStr};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::process::{Command as StdCommand, Stdio};
use std::time::Duration;

use nix::libc;
use nix::sys::signal::Signal;
use tokio::process::Command;
use tracing::debug;

use crate::config::{RunOptions, StdioSlot};
use crate::error::{Result, SpawnError};
use crate::pipe::StdioPipe;

/// Parsed, owned spawn descriptor.
pub(crate) struct SpawnSpec {
    pub(crate) file: CString,
    pub(crate) args: Vec<CString>,
    pub(crate) env: Option<Vec<CString>>,
    pub(crate) cwd: Option<CString>,
    pub(crate) uid: Option<u32>,
    pub(crate) gid: Option<u32>,
    pub(crate) detached: bool,
    pub(crate) windows_verbatim_arguments: bool,
    pub(crate) timeout: Option<Duration>,
    pub(crate) max_buffer: Option<u32>,
    pub(crate) kill_signal: Signal,
    pub(crate) stdio: Vec<StdioTarget>,
}

/// What each child fd is wired to. Pipe targets find their handles in the
/// runner's pipe array at the same index.
pub(crate) enum StdioTarget {
    Ignore,
    Pipe,
    Inherit(RawFd),
}

/// Copy a caller string into owned, null-terminated storage.
fn c_string(field: &'static str, value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| SpawnError::invalid(field, "contains an interior NUL byte"))
}

/// Numeric ids must fit the native unsigned id type exactly; out-of-range
/// values are rejected, never truncated.
fn id_in_range(field: &'static str, value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        SpawnError::invalid(field, format!("{value} does not fit the native id type"))
    })
}

/// Validate the caller record and convert it into a `SpawnSpec`.
///
/// Pipe slots are initialized (fd pair created, parent end bound to the
/// reactor) as they are parsed and attached to `pipes` immediately, so a
/// mid-parse failure still leaves every already-created handle owned by the
/// runner for the normal close path.
pub(crate) fn parse_options(
    options: &RunOptions,
    pipes: &mut Vec<Option<StdioPipe>>,
) -> Result<SpawnSpec> {
    let file = c_string("file", &options.file)?;

    if options.args.is_empty() {
        return Err(SpawnError::invalid("args", "argv must not be empty"));
    }
    let args = options
        .args
        .iter()
        .map(|arg| c_string("args", arg))
        .collect::<Result<Vec<_>>>()?;

    let cwd = options
        .cwd
        .as_deref()
        .map(|dir| c_string("cwd", dir))
        .transpose()?;

    let env = options
        .env_pairs
        .as_deref()
        .map(|pairs| {
            pairs
                .iter()
                .map(|pair| {
                    match pair.split_once('=') {
                        Some((key, _)) if !key.is_empty() => {}
                        _ => {
                            return Err(SpawnError::invalid(
                                "envPairs",
                                format!("`{pair}` is not a KEY=VALUE pair"),
                            ))
                        }
                    }
                    c_string("envPairs", pair)
                })
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?;

    let uid = options
        .uid
        .map(|value| id_in_range("uid", value))
        .transpose()?;
    let gid = options
        .gid
        .map(|value| id_in_range("gid", value))
        .transpose()?;

    let timeout = match options.timeout {
        None | Some(0) => None,
        Some(ms) if ms < 0 => {
            return Err(SpawnError::invalid("timeout", "must be non-negative"))
        }
        Some(ms) => Some(Duration::from_millis(ms as u64)),
    };

    let max_buffer = match options.max_buffer {
        None | Some(0) => None,
        Some(bytes) => Some(u32::try_from(bytes).map_err(|_| {
            SpawnError::invalid("maxBuffer", "does not fit an unsigned 32-bit value")
        })?),
    };

    let kill_signal = match options.kill_signal {
        None => Signal::SIGTERM,
        Some(0) => return Err(SpawnError::invalid("killSignal", "must be nonzero")),
        Some(signo) => Signal::try_from(signo).map_err(|_| {
            SpawnError::invalid("killSignal", format!("{signo} is not a known signal"))
        })?,
    };

    let mut stdio = Vec::with_capacity(options.stdio.len());
    for (child_fd, slot) in options.stdio.iter().enumerate() {
        debug_assert_eq!(pipes.len(), child_fd);
        match slot {
            StdioSlot::Ignore => {
                pipes.push(None);
                stdio.push(StdioTarget::Ignore);
            }
            StdioSlot::Pipe {
                readable,
                writable,
                input,
            } => {
                if !readable && !writable {
                    return Err(SpawnError::invalid(
                        "stdio",
                        format!("pipe slot {child_fd} has no direction"),
                    ));
                }
                if input.is_some() && !readable {
                    return Err(SpawnError::invalid(
                        "stdio",
                        format!("pipe slot {child_fd} has input but is not readable"),
                    ));
                }
                let mut pipe =
                    StdioPipe::new(*readable, *writable, input.clone().unwrap_or_default());
                pipe.initialize()?;
                pipes.push(Some(pipe));
                stdio.push(StdioTarget::Pipe);
            }
            StdioSlot::Inherit { fd } => {
                if *fd < 0 {
                    return Err(SpawnError::invalid(
                        "stdio",
                        format!("inherit slot {child_fd} has a negative fd"),
                    ));
                }
                pipes.push(None);
                stdio.push(StdioTarget::Inherit(*fd));
            }
        }
    }

    Ok(SpawnSpec {
        file,
        args,
        env,
        cwd,
        uid,
        gid,
        detached: options.detached,
        windows_verbatim_arguments: options.windows_verbatim_arguments,
        timeout,
        max_buffer,
        kill_signal,
        stdio,
    })
}

/// Build the spawnable command from the parsed descriptor, taking the child
/// ends out of the pipes. The returned fds back child fds ≥ 3 and must stay
/// open until the spawn happened, then be dropped.
pub(crate) fn build_command(
    spec: &SpawnSpec,
    pipes: &mut [Option<StdioPipe>],
) -> Result<(Command, Vec<OwnedFd>)> {
    let mut command = StdCommand::new(OsStr::from_bytes(spec.file.as_bytes()));

    // args[0] is the program name the child observes.
    if let Some(argv0) = spec.args.first() {
        command.arg0(OsStr::from_bytes(argv0.as_bytes()));
    }
    for arg in spec.args.iter().skip(1) {
        command.arg(OsStr::from_bytes(arg.as_bytes()));
    }

    if let Some(env) = &spec.env {
        command.env_clear();
        for pair in env {
            let bytes = pair.as_bytes();
            if let Some(pos) = bytes.iter().position(|&b| b == b'=') {
                command.env(
                    OsStr::from_bytes(&bytes[..pos]),
                    OsStr::from_bytes(&bytes[pos + 1..]),
                );
            }
        }
    }

    if let Some(cwd) = &spec.cwd {
        command.current_dir(OsStr::from_bytes(cwd.as_bytes()));
    }
    if let Some(uid) = spec.uid {
        command.uid(uid);
    }
    if let Some(gid) = spec.gid {
        command.gid(gid);
    }
    if spec.detached {
        command.process_group(0);
    }

    debug!(
        detached = spec.detached,
        verbatim_arguments = spec.windows_verbatim_arguments,
        stdio_count = spec.stdio.len(),
        "building spawn descriptor"
    );

    // Unconfigured standard fds are ignored, not inherited.
    command.stdin(Stdio::null());
    command.stdout(Stdio::null());
    command.stderr(Stdio::null());

    let mut held = Vec::new();
    let mut remap: Vec<(RawFd, RawFd)> = Vec::new();

    for (child_fd, target) in spec.stdio.iter().enumerate() {
        match target {
            StdioTarget::Ignore => {}
            StdioTarget::Pipe => {
                let fd = pipes
                    .get_mut(child_fd)
                    .and_then(Option::as_mut)
                    .and_then(StdioPipe::take_child_end)
                    .ok_or_else(|| {
                        SpawnError::invalid("stdio", format!("pipe slot {child_fd} lost its fd"))
                    })?;
                attach(&mut command, child_fd, fd, &mut held, &mut remap);
            }
            StdioTarget::Inherit(src) => {
                // Duplicate so closing the spawn descriptor cannot close the
                // caller's fd.
                let fd = unsafe { BorrowedFd::borrow_raw(*src) }.try_clone_to_owned()?;
                attach(&mut command, child_fd, fd, &mut held, &mut remap);
            }
        }
    }

    if !remap.is_empty() {
        let floor = spec.stdio.len().max(3) as libc::c_int;
        // Safety: the closure runs between fork and exec and only calls
        // async-signal-safe fcntl/dup2 on fds collected before the fork.
        unsafe {
            command.pre_exec(move || remap_child_fds(&mut remap, floor));
        }
    }

    let mut command = Command::from(command);
    command.kill_on_drop(false);
    Ok((command, held))
}

fn attach(
    command: &mut StdCommand,
    child_fd: usize,
    fd: OwnedFd,
    held: &mut Vec<OwnedFd>,
    remap: &mut Vec<(RawFd, RawFd)>,
) {
    match child_fd {
        0 => {
            command.stdin(Stdio::from(fd));
        }
        1 => {
            command.stdout(Stdio::from(fd));
        }
        2 => {
            command.stderr(Stdio::from(fd));
        }
        fd_num => {
            remap.push((fd.as_raw_fd(), fd_num as RawFd));
            held.push(fd);
        }
    }
}

/// Wire child fds ≥ 3 after the fork.
///
/// Two phases: first every source fd that sits inside the child's stdio
/// range is moved above it (F_DUPFD_CLOEXEC), so no dup2 target can clobber
/// a source that is still needed; then every source is dup2'ed onto its
/// slot, which also clears close-on-exec on the target.
fn remap_child_fds(pairs: &mut [(RawFd, RawFd)], floor: libc::c_int) -> io::Result<()> {
    for pair in pairs.iter_mut() {
        if pair.0 < floor {
            let moved = unsafe { libc::fcntl(pair.0, libc::F_DUPFD_CLOEXEC, floor) };
            if moved < 0 {
                return Err(io::Error::last_os_error());
            }
            pair.0 = moved;
        }
    }
    for &(src, dst) in pairs.iter() {
        if unsafe { libc::dup2(src, dst) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use nix::errno::Errno;

    use super::*;
    use crate::config::StdioSlot;

    fn parse(options: &RunOptions) -> Result<SpawnSpec> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let mut pipes = Vec::new();
        rt.block_on(async { parse_options(options, &mut pipes) })
    }

    fn errno_of(result: Result<SpawnSpec>) -> Errno {
        result.err().expect("expected a parse error").errno()
    }

    #[test]
    fn minimal_options_parse_with_defaults() {
        let spec = parse(&RunOptions::new("/bin/true")).unwrap();
        assert_eq!(spec.kill_signal, Signal::SIGTERM);
        assert!(spec.timeout.is_none());
        assert!(spec.max_buffer.is_none());
        assert!(spec.env.is_none());
        assert!(spec.stdio.is_empty());
    }

    #[test]
    fn empty_argv_is_rejected() {
        let options = RunOptions::new("/bin/true").args(Vec::<String>::new());
        assert_eq!(errno_of(parse(&options)), Errno::EINVAL);
    }

    #[test]
    fn interior_nul_is_rejected() {
        let options = RunOptions::new("/bin/true").args(["true", "a\0b"]);
        assert_eq!(errno_of(parse(&options)), Errno::EINVAL);
    }

    #[test]
    fn negative_timeout_is_rejected_and_zero_means_none() {
        assert_eq!(
            errno_of(parse(&RunOptions::new("/bin/true").timeout_ms(-1))),
            Errno::EINVAL
        );
        let spec = parse(&RunOptions::new("/bin/true").timeout_ms(0)).unwrap();
        assert!(spec.timeout.is_none());
    }

    #[test]
    fn out_of_range_ids_are_rejected_not_truncated() {
        let mut options = RunOptions::new("/bin/true");
        options.uid = Some(1 << 33);
        assert_eq!(errno_of(parse(&options)), Errno::EINVAL);

        let mut options = RunOptions::new("/bin/true");
        options.gid = Some(-1);
        assert_eq!(errno_of(parse(&options)), Errno::EINVAL);
    }

    #[test]
    fn max_buffer_must_fit_u32() {
        let options = RunOptions::new("/bin/true").max_buffer(1 << 33);
        assert_eq!(errno_of(parse(&options)), Errno::EINVAL);

        let spec = parse(&RunOptions::new("/bin/true").max_buffer(0)).unwrap();
        assert!(spec.max_buffer.is_none());
    }

    #[test]
    fn kill_signal_must_be_a_real_nonzero_signal() {
        assert_eq!(
            errno_of(parse(&RunOptions::new("/bin/true").kill_signal(0))),
            Errno::EINVAL
        );
        assert_eq!(
            errno_of(parse(&RunOptions::new("/bin/true").kill_signal(999))),
            Errno::EINVAL
        );
        let spec = parse(&RunOptions::new("/bin/true").kill_signal(9)).unwrap();
        assert_eq!(spec.kill_signal, Signal::SIGKILL);
    }

    #[test]
    fn malformed_env_pairs_are_rejected() {
        assert_eq!(
            errno_of(parse(&RunOptions::new("/bin/true").env_pairs(["NOVALUE"]))),
            Errno::EINVAL
        );
        assert_eq!(
            errno_of(parse(&RunOptions::new("/bin/true").env_pairs(["=empty-key"]))),
            Errno::EINVAL
        );
    }

    #[test]
    fn pipe_slot_needs_a_direction() {
        let options = RunOptions::new("/bin/true").stdio([StdioSlot::Pipe {
            readable: false,
            writable: false,
            input: None,
        }]);
        assert_eq!(errno_of(parse(&options)), Errno::EINVAL);
    }

    #[test]
    fn input_on_non_readable_pipe_is_rejected() {
        let options = RunOptions::new("/bin/true").stdio([StdioSlot::Pipe {
            readable: false,
            writable: true,
            input: Some(b"x".to_vec()),
        }]);
        assert_eq!(errno_of(parse(&options)), Errno::EINVAL);
    }

    #[test]
    fn negative_inherit_fd_is_rejected() {
        let options = RunOptions::new("/bin/true").stdio([StdioSlot::inherit(-1)]);
        assert_eq!(errno_of(parse(&options)), Errno::EINVAL);
    }

    #[test]
    fn pipe_slots_attach_to_the_pipe_array() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let options = RunOptions::new("/bin/cat")
                .stdio([StdioSlot::input(b"x".to_vec()), StdioSlot::capture(), StdioSlot::ignore()]);
            let mut pipes = Vec::new();
            let spec = parse_options(&options, &mut pipes).unwrap();

            assert_eq!(pipes.len(), 3);
            assert!(pipes[0].is_some());
            assert!(pipes[1].is_some());
            assert!(pipes[2].is_none());
            assert!(matches!(spec.stdio[2], StdioTarget::Ignore));

            for pipe in pipes.iter_mut().flatten() {
                pipe.close();
            }
        });
    }
}
