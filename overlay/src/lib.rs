//! Parent-side connection fabric for a tree-routed, process-spawning
//! execution overlay.
//!
//! A *master* process spawns children over a pluggable set of transports
//! (local fork/exec, `ssh`, `sudo`, `docker exec`, ...), each stream
//! progressing through a small handshake state machine before becoming a
//! live route in a tree-shaped [`router`]. Children can themselves request
//! onward connections (`proxy_connect`), extending the tree; IDs, routes
//! and modules are kept consistent across it via a small RPC set carried
//! over a length-prefixed [`message`] framing.
//!
//! # Examples
//!
//! ```ignore
//! use overlay::{config::RuntimeConfig, router::Router, transports::ConnectOptions};
//!
//! #[tokio::main]
//! async fn main() -> overlay::Result<()> {
//!     let config = RuntimeConfig::default();
//!     let preamble = include_str!("boot.py").to_string();
//!     let router = Router::new_master(config, preamble);
//!     let context = router
//!         .connect("local", Some("worker"), ConnectOptions::default())
//!         .await?;
//!     println!("connected: {}", context.id());
//!     Ok(())
//! }
//! ```
//!
//! See `examples/simple.rs` for a more complete example, including
//! `proxy_connect`.

pub mod bootstrap;
pub mod config;
pub mod context;
mod error;
pub mod fd;
pub mod id_allocator;
pub mod message;
pub mod minimiser;
pub mod module_forwarder;
pub mod process;
pub mod route_monitor;
pub mod router;
pub mod spawn;
pub mod stream;
pub mod transports;

pub use error::{Error, Result};

/// Logs a warning through the scoped logger when the `log` feature is
/// enabled, otherwise does nothing. Routing and allocator code paths use
/// this for conditions that are recoverable but worth a trace (a stale
/// route, an uncached module dependency) rather than propagating an
/// [`Error`] that would abort the caller's request.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        #[cfg(feature = "log")]
        {
            overlay_log::warn!($($arg)*);
        }
        #[cfg(not(feature = "log"))]
        {
            let _ = format_args!($($arg)*);
        }
    }};
}
