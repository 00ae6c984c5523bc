//! Subprocess supervision: spawns the target once per input, streams the input via
//! tempfile and/or stdin, drains output, and enforces timeouts and resource limits.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{kill, signal, SigHandler, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, dup2, execvp, fork, pipe, setsid, write, ForkResult, Pid};

use crate::util::{now_mono_ms, TempFile};

const FILE_PLACEHOLDER: &str = "@@";
const STDIN_MARKER: &str = "{stdin}";
const FSIZE_LIMIT: u64 = 64 * 1024 * 1024;
const READ_CHUNK: usize = 8192;

/// Per-execution tunables.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub timeout_ms: u64,
    pub mem_mb: u64,
    pub cov_shm_name: String,
}

/// Outcome of one target invocation. `exit_code == -1` means a host-side failure before
/// or during spawn; `err` then carries a diagnostic. This function never panics or
/// returns a `Result`, since a failed execution is data, not an error.
#[derive(Debug, Default, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub term_signal: i32,
    pub timed_out: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub err: String,
}

/// Runs `argv_template` once against `data`. `@@` is replaced with a tempfile path
/// holding `data`; `{stdin}` is stripped from argv and streams `data` to the child's
/// stdin instead. If neither sentinel is present, `@@` is assumed.
pub fn run(argv_template: &[String], data: &[u8], cfg: &ExecConfig) -> ExecResult {
    ignore_sigpipe_once();

    let mut need_file = argv_template.iter().any(|t| t == FILE_PLACEHOLDER);
    let use_stdin = argv_template.iter().any(|t| t == STDIN_MARKER);
    if !need_file && !use_stdin {
        need_file = true;
    }

    let mut tmp: Option<TempFile> = None;
    if need_file {
        match write_tempfile(data) {
            Ok(t) => tmp = Some(t),
            Err(e) => {
                return ExecResult {
                    exit_code: -1,
                    err: format!("mktemp_file failed: {e}"),
                    ..Default::default()
                }
            }
        }
    }

    let mut args: Vec<String> = Vec::with_capacity(argv_template.len());
    for t in argv_template {
        if t == FILE_PLACEHOLDER {
            let path = tmp.as_ref().expect("need_file implies tmp is Some");
            args.push(path.path().to_string_lossy().into_owned());
        } else if t == STDIN_MARKER {
            // stripped from argv
        } else {
            args.push(t.clone());
        }
    }

    if args.is_empty() {
        return ExecResult {
            exit_code: -1,
            err: "empty argv".to_string(),
            ..Default::default()
        };
    }

    run_child(&args, data, use_stdin, cfg)
}

fn write_tempfile(data: &[u8]) -> std::io::Result<TempFile> {
    use std::io::Write;
    let mut tmp = TempFile::create("fuzz")?;
    let mut off = 0;
    while off < data.len() {
        match tmp.file_mut().write(&data[off..]) {
            Ok(0) => break,
            Ok(n) => off += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    tmp.file_mut().sync_all()?;
    Ok(tmp)
}

fn run_child(args: &[String], data: &[u8], use_stdin: bool, cfg: &ExecConfig) -> ExecResult {
    let (in_r, in_w) = match pipe() {
        Ok(p) => p,
        Err(e) => {
            return ExecResult {
                exit_code: -1,
                err: format!("pipe() failed: in: {e}"),
                ..Default::default()
            }
        }
    };
    let (out_r, out_w) = match pipe() {
        Ok(p) => p,
        Err(e) => {
            return ExecResult {
                exit_code: -1,
                err: format!("pipe() failed: out: {e}"),
                ..Default::default()
            }
        }
    };
    let (err_r, err_w) = match pipe() {
        Ok(p) => p,
        Err(e) => {
            return ExecResult {
                exit_code: -1,
                err: format!("pipe() failed: err: {e}"),
                ..Default::default()
            }
        }
    };

    // SAFETY: between fork() and execvp()/_exit() in the child, only async-signal-safe
    // operations (dup2, close, setsid, setrlimit, execvp) are performed.
    let fork_result = unsafe { fork() };
    match fork_result {
        Ok(ForkResult::Child) => {
            child_main(args, use_stdin, &in_r, &in_w, &out_r, &out_w, &err_r, &err_w, cfg);
            unreachable!("child_main never returns");
        }
        Ok(ForkResult::Parent { child }) => {
            drop(in_r);
            drop(out_w);
            drop(err_w);
            parent_loop(child, in_w, out_r, err_r, data, use_stdin, cfg)
        }
        Err(e) => ExecResult {
            exit_code: -1,
            err: format!("fork() failed: {e}"),
            ..Default::default()
        },
    }
}

/// Runs entirely inside the forked child; never returns (always `_exit`s).
fn child_main(
    args: &[String],
    use_stdin: bool,
    in_r: &OwnedFd,
    in_w: &OwnedFd,
    out_r: &OwnedFd,
    out_w: &OwnedFd,
    err_r: &OwnedFd,
    err_w: &OwnedFd,
    cfg: &ExecConfig,
) -> ! {
    let _ = setsid();

    if use_stdin {
        let _ = dup2(in_r.as_raw_fd(), 0);
    } else if let Ok(devnull) = open("/dev/null", OFlag::O_RDONLY, Mode::empty()) {
        let _ = dup2(devnull.as_raw_fd(), 0);
    }
    let _ = dup2(out_w.as_raw_fd(), 1);
    let _ = dup2(err_w.as_raw_fd(), 2);

    let _ = close(in_r.as_raw_fd());
    let _ = close(in_w.as_raw_fd());
    let _ = close(out_r.as_raw_fd());
    let _ = close(out_w.as_raw_fd());
    let _ = close(err_r.as_raw_fd());
    let _ = close(err_w.as_raw_fd());

    set_rlimits(cfg.mem_mb);

    if !cfg.cov_shm_name.is_empty() {
        std::env::set_var("__FUZZ_SHARE", &cfg.cov_shm_name);
    }

    let argv: Vec<std::ffi::CString> = args
        .iter()
        .map(|s| std::ffi::CString::new(s.as_bytes()).unwrap_or_default())
        .collect();
    let prog = &argv[0];
    let _ = execvp(prog, &argv);
    eprintln!("execvp: {}", Errno::last());
    std::process::exit(127);
}

fn set_rlimits(mem_mb: u64) {
    if mem_mb > 0 {
        let bytes = mem_mb * 1024 * 1024;
        let _ = setrlimit(Resource::RLIMIT_AS, bytes, bytes);
    }
    let _ = setrlimit(Resource::RLIMIT_FSIZE, FSIZE_LIMIT, FSIZE_LIMIT);
}

static SIGPIPE_IGNORED: std::sync::Once = std::sync::Once::new();

fn ignore_sigpipe_once() {
    SIGPIPE_IGNORED.call_once(|| {
        // SAFETY: installing a simple ignore handler for SIGPIPE at process start.
        unsafe {
            let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
        }
    });
}

fn set_nonblocking(fd: RawFd) {
    use nix::fcntl::{fcntl, FcntlArg};
    if let Ok(flags) = fcntl(fd, FcntlArg::F_GETFL) {
        let flags = OFlag::from_bits_truncate(flags);
        let _ = fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK));
    }
}

fn drain(fd: BorrowedFd, dst: &mut Vec<u8>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match nix::unistd::read(fd.as_raw_fd(), &mut buf) {
            Ok(0) => break,
            Ok(n) => dst.extend_from_slice(&buf[..n]),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => break,
            Err(_) => break,
        }
    }
}

fn parent_loop(
    child: Pid,
    in_w: OwnedFd,
    out_r: OwnedFd,
    err_r: OwnedFd,
    data: &[u8],
    use_stdin: bool,
    cfg: &ExecConfig,
) -> ExecResult {
    set_nonblocking(out_r.as_raw_fd());
    set_nonblocking(err_r.as_raw_fd());

    let mut in_w = if use_stdin { Some(in_w) } else { None };

    let mut out_buf = Vec::new();
    let mut err_buf = Vec::new();
    let mut in_off = 0usize;
    let start = now_mono_ms();

    let mut result = ExecResult::default();

    loop {
        let mut fds: Vec<PollFd> = Vec::with_capacity(3);
        if let Some(w) = &in_w {
            fds.push(PollFd::new(w.as_fd(), PollFlags::POLLOUT));
        }
        fds.push(PollFd::new(out_r.as_fd(), PollFlags::POLLIN));
        fds.push(PollFd::new(err_r.as_fd(), PollFlags::POLLIN));

        let elapsed = now_mono_ms().saturating_sub(start);
        let remaining = cfg.timeout_ms.saturating_sub(elapsed).max(1);
        let timeout = PollTimeout::try_from(remaining.min(i32::MAX as u64) as u32)
            .unwrap_or(PollTimeout::MAX);

        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(_) => {}
        }

        drain(out_r.as_fd(), &mut out_buf);
        drain(err_r.as_fd(), &mut err_buf);

        if use_stdin && in_off < data.len() {
            if let Some(w) = &in_w {
                match write(w, &data[in_off..]) {
                    Ok(n) if n > 0 => in_off += n,
                    Ok(_) => {}
                    Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
                    Err(_) => {
                        in_w = None;
                    }
                }
            }
            if in_off >= data.len() {
                in_w = None;
            }
        }

        match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => {
                result.exit_code = code;
                drain(out_r.as_fd(), &mut out_buf);
                drain(err_r.as_fd(), &mut err_buf);
                break;
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                result.term_signal = sig as i32;
                drain(out_r.as_fd(), &mut out_buf);
                drain(err_r.as_fd(), &mut err_buf);
                break;
            }
            Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => {}
            _ => {}
        }

        if now_mono_ms().saturating_sub(start) >= cfg.timeout_ms {
            result.timed_out = true;
            // `setsid()` in the child made it its own process-group leader, so a
            // negated pid targets the whole group, not just the immediate child.
            let _ = kill(Pid::from_raw(-child.as_raw()), Signal::SIGKILL);
            let _ = waitpid(child, None);
            break;
        }
    }

    result.stdout = out_buf;
    result.stderr = err_buf;
    result
}
