//! Spawns a local child, lets it finish its handshake, then proxy-connects
//! a second hop through it.

use overlay::{
    config::RuntimeConfig,
    router::Router,
    transports::ConnectOptions,
    Error,
};

/// A minimal bootstrap preamble: enough for the EC0/EC1 handshake markers
/// to show up on stdout so `connect()` can observe the child reaching
/// `live`. A real deployment embeds the full runtime here instead.
const PREAMBLE: &str = r#"
import sys
sys.stdout.write("EC1")
sys.stdout.flush()
sys.stdin.read()
"#;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _guard = overlay_log::async_logger("overlay-simple", true)
        .await
        .map_err(|err| Error::GeneralError(Box::new(err)))?;

    overlay_log::info!("starting master router");

    let config = RuntimeConfig::default();
    let router = Router::new_master(config, PREAMBLE.to_string());

    let worker = router
        .connect("local", Some("worker"), ConnectOptions::default())
        .await?;
    overlay_log::info!("connected"; "id" => worker.id(), "name" => worker.name().unwrap_or_default());

    // A second hop, proxied through `worker` rather than spawned directly
    // by the master.
    match router
        .proxy_connect(&worker, "local", Some("nested"), ConnectOptions::default())
        .await
    {
        Ok(nested) => {
            overlay_log::info!("proxy-connected"; "id" => nested.id(), "via" => worker.id());
        }
        Err(err) => overlay_log::warn!("proxy_connect failed: {}", err),
    }

    worker.disconnected().await;
    overlay_log::info!("worker disconnected");

    Ok(())
}
