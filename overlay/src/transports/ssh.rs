use super::TransportMethod;
use crate::spawn::SpawnMode;

/// Reaches the target over an interactive `ssh` subprocess. Needs a
/// controlling terminal so host-key prompts and password auth pass
/// through without being mangled by line discipline.
pub struct Ssh {
    pub hostname: String,
}

impl TransportMethod for Ssh {
    fn spawn_mode(&self) -> SpawnMode {
        SpawnMode::Hybrid
    }

    fn wrap_argv(&self, boot_argv: &[String]) -> Vec<String> {
        let mut argv = vec![
            "ssh".to_string(),
            "-o".to_string(),
            "BatchMode=no".to_string(),
            self.hostname.clone(),
            "--".to_string(),
        ];
        argv.extend_from_slice(boot_argv);
        argv
    }
}
