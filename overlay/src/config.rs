//! Runtime configuration shared by every component in the fabric.

use std::{borrow::Cow, path::PathBuf, time::Duration};

/// Tunables threaded through the spawner, parent stream and router.
///
/// Mirrors the keyword bundle the bootstrap preamble embeds (§4.2): parent
/// ID chain, debug/profile flags, log level, module whitelist/blacklist and
/// maximum message size all travel with a connecting child from the moment
/// it's spawned.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Interpreter binary used to run the bootstrap, platform-corrected:
    /// never `/usr/bin/python` on Darwin, where it is a stub that prints a
    /// deprecation warning instead of running.
    pub interpreter: PathBuf,
    /// Wall-clock deadline for a connect to reach the `live` state.
    pub connect_timeout: Duration,
    /// Upper bound on a single frame's payload length.
    pub max_message_size: u32,
    /// Enables verbose tracing in the spawned runtime.
    pub debug: bool,
    /// Enables profiling instrumentation in the spawned runtime.
    pub profiling: bool,
    /// If non-empty, only these module name prefixes may be imported.
    pub module_whitelist: Vec<Cow<'static, str>>,
    /// Module name prefixes that are never importable, checked after the
    /// whitelist.
    pub module_blacklist: Vec<Cow<'static, str>>,
    /// Effective log level passed down to children via the preamble.
    pub log_level: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            connect_timeout: Duration::from_secs(30),
            max_message_size: 0x1000_0000,
            debug: false,
            profiling: false,
            module_whitelist: Vec::new(),
            module_blacklist: Vec::new(),
            log_level: None,
        }
    }
}

impl RuntimeConfig {
    pub fn is_module_allowed(&self, name: &str) -> bool {
        let whitelisted =
            self.module_whitelist.is_empty() || prefix_matches(&self.module_whitelist, name);
        whitelisted && !prefix_matches(&self.module_blacklist, name)
    }
}

fn prefix_matches(prefixes: &[Cow<'static, str>], name: &str) -> bool {
    prefixes.iter().any(|prefix| name.starts_with(prefix.as_ref()))
}

/// Resolves the interpreter to re-exec into on the *local* platform.
///
/// On Darwin, `/usr/bin/python` is a deprecation stub since macOS 12; the
/// first real interpreter on `PATH` is used instead.
#[cfg(target_os = "macos")]
fn default_interpreter() -> PathBuf {
    which_python().unwrap_or_else(|| PathBuf::from("/usr/bin/python3"))
}

#[cfg(not(target_os = "macos"))]
fn default_interpreter() -> PathBuf {
    PathBuf::from("/usr/bin/python3")
}

#[cfg(target_os = "macos")]
fn which_python() -> Option<PathBuf> {
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join("python3"))
            .find(|candidate| candidate.is_file())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_restrictions() {
        let config = RuntimeConfig::default();
        assert!(config.is_module_allowed("anything.at.all"));
    }

    #[test]
    fn whitelist_restricts_to_prefix() {
        let mut config = RuntimeConfig::default();
        config.module_whitelist.push("overlay.".into());
        assert!(config.is_module_allowed("overlay.router"));
        assert!(!config.is_module_allowed("other.thing"));
    }

    #[test]
    fn blacklist_wins_over_whitelist() {
        let mut config = RuntimeConfig::default();
        config.module_whitelist.push("overlay.".into());
        config.module_blacklist.push("overlay.secret".into());
        assert!(!config.is_module_allowed("overlay.secret.keys"));
    }
}
