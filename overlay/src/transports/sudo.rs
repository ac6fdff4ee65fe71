use super::TransportMethod;
use crate::spawn::SpawnMode;

/// A privilege-elevation pipe. Needs a controlling terminal for the
/// password prompt unless the caller has configured passwordless sudo.
pub struct Sudo {
    pub username: Option<String>,
}

impl TransportMethod for Sudo {
    fn spawn_mode(&self) -> SpawnMode {
        SpawnMode::Hybrid
    }

    fn wrap_argv(&self, boot_argv: &[String]) -> Vec<String> {
        let mut argv = vec!["sudo".to_string()];
        if let Some(username) = &self.username {
            argv.push("-u".to_string());
            argv.push(username.clone());
        }
        argv.push("-H".to_string());
        argv.push("--".to_string());
        argv.extend_from_slice(boot_argv);
        argv
    }
}
