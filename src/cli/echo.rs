use anyhow::{Context, Result};

use crate::settings::Settings;

pub async fn handle_echo_server(host: Option<String>, port: Option<u16>) -> Result<()> {
    let settings = Settings::new().context("Failed to load settings")?;
    let mut server = settings.echo_server;
    if let Some(host) = host {
        server.host = host;
    }
    if let Some(port) = port {
        server.port = port;
    }
    crate::echo::run_server(&server).await
}
