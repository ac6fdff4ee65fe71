use super::TransportMethod;
use crate::spawn::SpawnMode;

/// The base parent transport: runs the interpreter directly, no launcher.
pub struct Local;

impl TransportMethod for Local {
    fn spawn_mode(&self) -> SpawnMode {
        SpawnMode::Socketpair { merge_stderr: false }
    }

    fn wrap_argv(&self, boot_argv: &[String]) -> Vec<String> {
        boot_argv.to_vec()
    }
}
