//! A per-child object owning the spawned process, its byte stream, the
//! handshake state machine, and graceful shutdown / child reaping.

use crate::{
    bootstrap::{EC0, EC1},
    config::RuntimeConfig,
    context::Context,
    error::Error,
    message::Handler,
    spawn::{self, SpawnMode, Spawned},
};
use nix::{
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag},
    },
    unistd::Pid,
};
use parking_lot::Mutex as SyncMutex;
use std::{
    collections::HashSet,
    os::unix::io::{FromRawFd, RawFd},
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
    time::timeout,
};

/// One-way handshake progression; see the state table in the parent stream
/// design: `new -> await_ec0 -> await_ec1 -> live -> gone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    New,
    AwaitEc0,
    AwaitEc1,
    Live,
    Gone,
}

/// A live (or tombstoned) connection to a single directly spawned child.
pub struct ParentStream {
    pub pid: Pid,
    pub remote_id: u32,
    pub name: String,
    pub handler: Handler,
    /// Context IDs reachable through this stream, seeded with `remote_id`.
    pub routes: SyncMutex<HashSet<u32>>,
    /// Module names already pushed to this child.
    pub modules_pushed: SyncMutex<HashSet<String>>,
    state: SyncMutex<StreamState>,
    reaped: AtomicBool,
}

impl ParentStream {
    /// Spawns a child by exec'ing `argv` over `mode`, runs the handshake
    /// delivering `compressed_preamble`, and returns a live stream. `argv`
    /// is already transport-wrapped (e.g. `["ssh", host, python, "-c", ...]`);
    /// building it is the caller's (router/transport) responsibility.
    pub async fn connect(
        config: &RuntimeConfig,
        remote_id: u32,
        remote_name: &str,
        mode: SpawnMode,
        argv: &[String],
        compressed_preamble: &[u8],
    ) -> Result<Self, Error> {
        validate_name(remote_name)?;

        let Spawned { pid, primary_fd, .. } = spawn::spawn_child(argv, mode)
            .map_err(|err| Error::StreamSetup(format!("{}: {}", crate::process::escape_argv(argv), err).into()))?;

        let mut socket = fd_to_stream(primary_fd)?;
        let deadline = Instant::now() + config.connect_timeout;

        if let Err(err) = run_handshake(&mut socket, compressed_preamble, deadline).await {
            let _ = kill(pid, Signal::SIGTERM);
            let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
            return Err(err);
        }

        Ok(Self {
            pid,
            remote_id,
            name: format!("{}.{}", remote_name, pid),
            handler: Handler::new(socket),
            routes: SyncMutex::new(HashSet::from([remote_id])),
            modules_pushed: SyncMutex::new(HashSet::new()),
            state: SyncMutex::new(StreamState::Live),
            reaped: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    /// Reaps the child at most once: registers it with the process-wide
    /// [`crate::process::ProcessMonitor`] (so its exit status is collected
    /// the next time `SIGCHLD` fires, rather than racing a direct
    /// `waitpid` here against the monitor's own), then sends `SIGTERM`.
    /// `ESRCH` (already exited) and `EPERM` (setuid children such as
    /// `sudo`) are tolerated; other OS errors propagate.
    pub fn reap_child(&self) -> Result<(), Error> {
        if self.reaped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = crate::process::ProcessMonitor::global().wait_for(self.pid);

        match kill(self.pid, Signal::SIGTERM) {
            Ok(()) | Err(nix::Error::EPERM) | Err(nix::Error::ESRCH) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn mark_gone(&self) {
        *self.state.lock() = StreamState::Gone;
    }

    /// Builds a stream around an already-connected handler, skipping
    /// spawn and handshake, for exercising router dispatch in isolation.
    #[cfg(test)]
    pub(crate) fn test_only(remote_id: u32, name: &str, handler: Handler) -> Self {
        Self {
            pid: Pid::this(),
            remote_id,
            name: name.to_string(),
            handler,
            routes: SyncMutex::new(HashSet::from([remote_id])),
            modules_pushed: SyncMutex::new(HashSet::new()),
            state: SyncMutex::new(StreamState::Live),
            reaped: AtomicBool::new(true),
        }
    }
}

fn validate_name(name: &str) -> Result<(), Error> {
    if name.contains('/') || name.contains('\\') {
        return Err(Error::StreamSetup(
            format!("invalid remote name: {}", name).into(),
        ));
    }
    Ok(())
}

/// Wraps a freshly spawned child's fd as an async stream. The fd is either
/// a genuine `AF_UNIX` socket (socketpair mode) or a pty master; both
/// present as a pollable byte stream to epoll/kqueue, which is all this
/// reference implementation relies on.
fn fd_to_stream(fd: RawFd) -> Result<UnixStream, Error> {
    let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
    std_stream
        .set_nonblocking(true)
        .map_err(|err| Error::StreamSetup(err.to_string().into()))?;
    UnixStream::from_std(std_stream).map_err(|err| Error::StreamSetup(err.to_string().into()))
}

async fn run_handshake(
    socket: &mut UnixStream,
    compressed_preamble: &[u8],
    deadline: Instant,
) -> Result<(), Error> {
    discard_until(socket, EC0, deadline).await?;
    write_all_deadline(socket, compressed_preamble, deadline).await?;

    let second_deadline = Instant::now() + Duration::from_secs(10).min(remaining(deadline));
    discard_until(socket, EC1, second_deadline).await?;

    Ok(())
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Bytes of trailing context kept for the `StreamClosed` diagnostic if the
/// peer hits EOF mid-handshake.
const DIAGNOSTIC_TAIL_LEN: usize = 300;

/// Reads and discards bytes until `sentinel` appears as a suffix of what's
/// been read so far, or the deadline expires. Transport chatter (e.g.
/// `sudo`'s password prompt on a merged stderr) is silently dropped.
async fn discard_until(socket: &mut UnixStream, sentinel: &[u8], deadline: Instant) -> Result<(), Error> {
    let mut tail: Vec<u8> = Vec::with_capacity(DIAGNOSTIC_TAIL_LEN);
    let mut chunk = [0u8; 4096];

    loop {
        let budget = remaining(deadline);
        if budget.is_zero() {
            return Err(Error::Timeout("handshake marker"));
        }

        let read = timeout(budget, socket.read(&mut chunk))
            .await
            .map_err(|_| Error::Timeout("handshake marker"))?
            .map_err(Error::from)?;

        if read == 0 {
            return Err(Error::StreamClosed(String::from_utf8_lossy(&tail).into_owned()));
        }

        tail.extend_from_slice(&chunk[..read]);
        if tail.len() > DIAGNOSTIC_TAIL_LEN {
            let excess = tail.len() - DIAGNOSTIC_TAIL_LEN;
            tail.drain(..excess);
        }

        if tail.ends_with(sentinel) {
            return Ok(());
        }
    }
}

async fn write_all_deadline(socket: &mut UnixStream, data: &[u8], deadline: Instant) -> Result<(), Error> {
    let budget = remaining(deadline);
    if budget.is_zero() {
        return Err(Error::Timeout("preamble write"));
    }
    timeout(budget, socket.write_all(data))
        .await
        .map_err(|_| Error::Timeout("preamble write"))?
        .map_err(Error::from)?;
    Ok(())
}

/// The disconnect hook a route monitor attaches to a stream, marking it
/// gone and reaping its child once delivered.
pub fn on_disconnect(stream: &ParentStream, contexts: &[Context]) {
    stream.mark_gone();
    if let Err(err) = stream.reap_child() {
        crate::log_warn!("failed to reap child {}: {}", stream.pid, err);
    }
    for context in contexts {
        context.notify_disconnected();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_names_with_path_separators() {
        assert!(validate_name("local/1").is_err());
        assert!(validate_name("local.1").is_ok());
    }
}
