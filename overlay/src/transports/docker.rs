use super::TransportMethod;
use crate::spawn::SpawnMode;

/// A container-entry command. No controlling terminal needed; `docker exec
/// -i` gives a plain pipe.
pub struct Docker {
    pub container: String,
}

impl TransportMethod for Docker {
    fn spawn_mode(&self) -> SpawnMode {
        SpawnMode::Socketpair { merge_stderr: false }
    }

    fn wrap_argv(&self, boot_argv: &[String]) -> Vec<String> {
        let mut argv = vec![
            "docker".to_string(),
            "exec".to_string(),
            "-i".to_string(),
            self.container.clone(),
        ];
        argv.extend_from_slice(boot_argv);
        argv
    }
}
