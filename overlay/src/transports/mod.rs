//! Per-transport command construction: each transport is a thin leaf on
//! top of the local transport's boot command, wrapping it in whatever
//! launcher (`ssh`, `sudo`, `docker exec`) reaches the target.

mod docker;
mod local;
mod ssh;
mod sudo;

use crate::{error::Error, spawn::SpawnMode};
use overlay_derive::Transport;
use std::{borrow::Cow, collections::HashMap};

/// The transport method names this build knows how to construct. "local"
/// is an alias for the base parent transport: no launcher wraps the boot
/// command, the interpreter runs directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Transport)]
pub enum TransportKind {
    Local,
    Ssh,
    Sudo,
    Docker,
}

/// Per-connect options a transport may need (hostname, username,
/// container name, ...). Unused fields are simply ignored by transports
/// that don't need them.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub container: Option<String>,
    pub extra: HashMap<String, String>,
}

/// A concrete transport instance, bound to its connect options.
pub trait TransportMethod: Send + Sync {
    fn spawn_mode(&self) -> SpawnMode;
    fn wrap_argv(&self, boot_argv: &[String]) -> Vec<String>;
}

/// Builds the transport implementation for `kind`, validating that
/// `options` carries whatever that transport requires.
pub fn build(kind: TransportKind, options: &ConnectOptions) -> Result<Box<dyn TransportMethod>, Error> {
    match kind {
        TransportKind::Local => Ok(Box::new(local::Local)),
        TransportKind::Ssh => {
            let hostname = options
                .hostname
                .clone()
                .ok_or_else(|| missing("ssh", "hostname"))?;
            Ok(Box::new(ssh::Ssh { hostname }))
        }
        TransportKind::Sudo => Ok(Box::new(sudo::Sudo {
            username: options.username.clone(),
        })),
        TransportKind::Docker => {
            let container = options
                .container
                .clone()
                .ok_or_else(|| missing("docker", "container"))?;
            Ok(Box::new(docker::Docker { container }))
        }
    }
}

/// Resolves a method name string (as passed to `Router::connect`) to a
/// transport instance, via the registry generated by `#[derive(Transport)]`.
pub fn build_by_method_name(method: &str, options: &ConnectOptions) -> Result<Box<dyn TransportMethod>, Error> {
    let kind: TransportKind = method
        .parse()
        .map_err(|_| Error::UnknownMethod(Cow::Owned(method.to_string())))?;
    build(kind, options)
}

fn missing(transport: &'static str, field: &'static str) -> Error {
    Error::StreamSetup(format!("{} transport requires {}", transport, field).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_is_a_valid_method_name() {
        assert_eq!("local".parse::<TransportKind>(), Ok(TransportKind::Local));
    }

    #[test]
    fn unknown_method_name_is_rejected() {
        assert!(build_by_method_name("telepathy", &ConnectOptions::default()).is_err());
    }

    #[test]
    fn ssh_without_hostname_is_rejected() {
        assert!(build_by_method_name("ssh", &ConnectOptions::default()).is_err());
    }
}
