//! Creates a child process with its I/O attached to a socket pair, a
//! pseudo-terminal, or a hybrid of both.

use crate::error::Error;
use close_fds::close_open_fds;
use nix::{
    pty::openpty,
    sys::{
        socket::{setsockopt, sockopt, AddressFamily, SockFlag, SockType},
        termios::{tcgetattr, tcsetattr, InputFlags, LocalFlags, OutputFlags, SetArg},
    },
    unistd::{dup2, execv, fork, setsid, ForkResult, Pid},
};
use std::{
    ffi::CString,
    os::unix::io::{AsRawFd, BorrowedFd, IntoRawFd, RawFd},
};

/// Send/receive buffer size set on a freshly created socketpair, matching
/// the framing layer's read chunk size so a full frame can move in one
/// syscall instead of being split across several.
const STREAM_BUFFER_SIZE: usize = 131_072;

/// How a child's standard streams are wired up to the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnMode {
    /// stdin/stdout (optionally stderr too) on a stream socket pair. Used
    /// for the local transport and any transport that doesn't need a
    /// controlling terminal (most non-interactive remote shells).
    Socketpair { merge_stderr: bool },
    /// stdin/stdout/stderr all on a pseudo-terminal. Needed so password
    /// prompts issued by `sudo` or interactive `ssh` aren't mangled by
    /// line discipline.
    Tty,
    /// Data on a socket pair, a pty for stderr and the controlling
    /// terminal role. The pty fd is handed back separately so the caller
    /// can attach a log-only reader to it.
    Hybrid,
}

/// The outcome of spawning a child: its PID, the primary fd used for the
/// handshake, and an auxiliary fd (the pty, in `Hybrid` mode) if any.
pub struct Spawned {
    pub pid: Pid,
    pub primary_fd: RawFd,
    pub aux_fd: Option<RawFd>,
}

/// Spawns `argv[0]` with `argv[1..]`, wiring stdio per `mode`.
///
/// The child closes every fd above 2 (or above the pty slave, in `Tty`
/// mode) before exec, and the parent's end is never inherited.
pub fn spawn_child(argv: &[String], mode: SpawnMode) -> Result<Spawned, Error> {
    match mode {
        SpawnMode::Socketpair { merge_stderr } => spawn_socketpair(argv, merge_stderr),
        SpawnMode::Tty => spawn_tty(argv),
        SpawnMode::Hybrid => spawn_hybrid(argv),
    }
}

fn spawn_socketpair(argv: &[String], merge_stderr: bool) -> Result<Spawned, Error> {
    let (parent_end, child_end) = nix::sys::socket::socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .map_err(|err| Error::StreamSetup(err.to_string().into()))?;
    let parent_end = parent_end.into_raw_fd();
    let child_end = child_end.into_raw_fd();
    set_stream_buffers(parent_end)?;
    set_stream_buffers(child_end)?;

    match unsafe { fork() }.map_err(|err| Error::StreamSetup(err.to_string().into()))? {
        ForkResult::Parent { child } => {
            let _ = nix::unistd::close(child_end);
            let primary_fd = duplicate(parent_end)?;
            Ok(Spawned {
                pid: child,
                primary_fd,
                aux_fd: None,
            })
        }
        ForkResult::Child => {
            let _ = nix::unistd::close(parent_end);
            dup2(child_end, libc::STDIN_FILENO).ok();
            dup2(child_end, libc::STDOUT_FILENO).ok();
            if merge_stderr {
                dup2(child_end, libc::STDERR_FILENO).ok();
            }
            exec_child(argv, child_end)
        }
    }
}

fn spawn_tty(argv: &[String]) -> Result<Spawned, Error> {
    let pty = openpty(None, None).map_err(|err| Error::StreamSetup(err.to_string().into()))?;
    set_raw(pty.slave.as_raw_fd())?;

    match unsafe { fork() }.map_err(|err| Error::StreamSetup(err.to_string().into()))? {
        ForkResult::Parent { child } => {
            let primary_fd = duplicate(pty.master.as_raw_fd())?;
            Ok(Spawned {
                pid: child,
                primary_fd,
                aux_fd: None,
            })
        }
        ForkResult::Child => {
            let _ = setsid();
            let slave = pty.slave.as_raw_fd();
            dup2(slave, libc::STDIN_FILENO).ok();
            dup2(slave, libc::STDOUT_FILENO).ok();
            dup2(slave, libc::STDERR_FILENO).ok();
            unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) };
            exec_child(argv, slave)
        }
    }
}

fn spawn_hybrid(argv: &[String]) -> Result<Spawned, Error> {
    let (parent_sock, child_sock) = nix::sys::socket::socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .map_err(|err| Error::StreamSetup(err.to_string().into()))?;
    let parent_sock = parent_sock.into_raw_fd();
    let child_sock = child_sock.into_raw_fd();
    set_stream_buffers(parent_sock)?;
    set_stream_buffers(child_sock)?;
    let pty = openpty(None, None).map_err(|err| Error::StreamSetup(err.to_string().into()))?;
    set_raw(pty.slave.as_raw_fd())?;

    match unsafe { fork() }.map_err(|err| Error::StreamSetup(err.to_string().into()))? {
        ForkResult::Parent { child } => {
            let _ = nix::unistd::close(child_sock);
            let primary_fd = duplicate(parent_sock)?;
            let aux_fd = duplicate(pty.master.as_raw_fd())?;
            Ok(Spawned {
                pid: child,
                primary_fd,
                aux_fd: Some(aux_fd),
            })
        }
        ForkResult::Child => {
            let _ = nix::unistd::close(parent_sock);
            let _ = setsid();
            let slave = pty.slave.as_raw_fd();
            unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) };
            dup2(child_sock, libc::STDIN_FILENO).ok();
            dup2(child_sock, libc::STDOUT_FILENO).ok();
            dup2(slave, libc::STDERR_FILENO).ok();
            exec_child(argv, child_sock)
        }
    }
}

/// Duplicates `fd` to decouple it from the original owner's lifetime.
fn duplicate(fd: RawFd) -> Result<RawFd, Error> {
    nix::unistd::dup(fd).map_err(|err| Error::StreamSetup(err.to_string().into()))
}

/// Sets both buffer sizes on a socketpair end before fork, so neither side
/// throttles the other mid-frame regardless of which end ends up the
/// read-heavy one.
fn set_stream_buffers(fd: RawFd) -> Result<(), Error> {
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    setsockopt(&fd, sockopt::SndBuf, &STREAM_BUFFER_SIZE)
        .map_err(|err| Error::StreamSetup(err.to_string().into()))?;
    setsockopt(&fd, sockopt::RcvBuf, &STREAM_BUFFER_SIZE)
        .map_err(|err| Error::StreamSetup(err.to_string().into()))?;
    Ok(())
}

/// Zeroes input/output/local flags other than 8-bit character size, which
/// is deliberately stricter than `cfmakeraw` to get identical behaviour
/// across Linux and BSD.
fn set_raw(fd: RawFd) -> Result<(), Error> {
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut termios = tcgetattr(fd).map_err(|err| Error::StreamSetup(err.to_string().into()))?;
    termios.input_flags = InputFlags::empty();
    termios.output_flags = OutputFlags::empty();
    termios.local_flags = LocalFlags::empty();
    termios.control_flags &= !nix::sys::termios::ControlFlags::CSIZE;
    termios.control_flags |= nix::sys::termios::ControlFlags::CS8;
    tcsetattr(fd, SetArg::TCSANOW, &termios)
        .map_err(|err| Error::StreamSetup(err.to_string().into()))?;
    Ok(())
}

/// Closes descriptors above `keep` and execs `argv`, never returning on
/// success.
fn exec_child(argv: &[String], keep: RawFd) -> ! {
    unsafe { close_open_fds(keep + 1, &[]) };

    let program = CString::new(argv[0].as_bytes()).expect("argv[0] has no interior NUL");
    let args = argv
        .iter()
        .map(|arg| CString::new(arg.as_bytes()).expect("argv has no interior NUL"))
        .collect::<Vec<_>>();

    let _ = execv(&program, &args);
    // execv only returns on failure.
    unsafe { libc::_exit(127) }
}

/// Mode appropriate for a given transport's needs, and whether to close
/// stderr onto the same fd as stdin/stdout for environments that forbid a
/// TTY on stdio entirely.
pub fn mode_for_transport(needs_tty: bool, merge_stderr: bool) -> SpawnMode {
    if needs_tty {
        SpawnMode::Hybrid
    } else {
        SpawnMode::Socketpair { merge_stderr }
    }
}
