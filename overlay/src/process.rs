//! Process-wide SIGCHLD dispatcher: demultiplexes child exits to per-PID
//! waiters, and a small shell-escaping helper for diagnostic messages.

use nix::{
    sys::wait::{waitpid, WaitPidFlag, WaitStatus},
    unistd::Pid,
};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::oneshot,
};

static MONITOR: OnceCell<Arc<ProcessMonitor>> = OnceCell::new();

/// Lazily initialised singleton: one `SIGCHLD` listener task per process,
/// regardless of how many streams are waiting on child exits.
pub struct ProcessMonitor {
    waiters: Mutex<HashMap<Pid, oneshot::Sender<WaitStatus>>>,
}

impl ProcessMonitor {
    /// Returns the process-wide monitor, starting its listener task on
    /// first use.
    pub fn global() -> Arc<Self> {
        MONITOR
            .get_or_init(|| {
                let monitor = Arc::new(Self {
                    waiters: Mutex::new(HashMap::new()),
                });
                monitor.clone().spawn_listener();
                monitor
            })
            .clone()
    }

    fn spawn_listener(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut stream = match signal(SignalKind::child()) {
                Ok(stream) => stream,
                Err(_) => return,
            };
            loop {
                if stream.recv().await.is_none() {
                    break;
                }
                self.reap_all();
            }
        });
    }

    /// `waitpid`s with `WNOHANG` until no more children are immediately
    /// reapable, invoking each waiter's callback with its exit status
    /// exactly once.
    fn reap_all(&self) {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Err(nix::Error::ECHILD) => break,
                Err(_) => break,
                Ok(status) => {
                    if let Some(pid) = status.pid() {
                        if let Some(waiter) = self.waiters.lock().remove(&pid) {
                            let _ = waiter.send(status);
                        }
                    }
                }
            }
        }
    }

    /// Registers interest in `pid`'s exit, returning a receiver that
    /// resolves with its [`WaitStatus`] the next time `SIGCHLD` fires for
    /// it.
    pub fn wait_for(&self, pid: Pid) -> oneshot::Receiver<WaitStatus> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(pid, tx);
        rx
    }
}

/// Shell-escapes an argv list for inclusion in a diagnostic message, the
/// way a spawn failure's attempted-command-line text is built.
pub fn escape_argv(argv: &[String]) -> String {
    argv.iter().map(|arg| escape(arg)).collect::<Vec<_>>().join(" ")
}

fn escape(arg: &str) -> String {
    let is_plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@".contains(c));
    if is_plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_arguments_with_spaces_and_quotes() {
        assert_eq!(escape_argv(&["echo".into(), "a b".into()]), "echo 'a b'");
        assert_eq!(escape("it's"), r"'it'\''s'");
    }

    #[test]
    fn leaves_plain_arguments_unquoted() {
        assert_eq!(escape_argv(&["ssh".into(), "host.example.com".into()]), "ssh host.example.com");
    }

    #[tokio::test]
    async fn wait_for_resolves_on_child_exit() {
        use nix::unistd::{fork, ForkResult};

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => unsafe { libc::_exit(0) },
            ForkResult::Parent { child } => {
                let monitor = ProcessMonitor::global();
                let rx = monitor.wait_for(child);
                // In case SIGCHLD already landed before we registered.
                monitor.reap_all();
                let _ = tokio::time::timeout(std::time::Duration::from_secs(2), rx).await;
            }
        }
    }
}
