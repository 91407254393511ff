/*
 * Gitkit SSH Server
 * Copyright (C) 2025 Akaere Networks
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use gitkit_ssh::config::Cli;
use gitkit_ssh::{AuthorizedKeys, Error, GitSshServer};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize logging; RUST_LOG takes precedence over --debug/--trace
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let config = args.load_config()?;
    let mut server = GitSshServer::new(config.clone());

    if config.auth {
        let path = config
            .authorized_keys
            .as_ref()
            .context("authentication is enabled but no authorized keys file was given")?;
        let keys = AuthorizedKeys::from_file(path)?;
        info!("Loaded {} authorized keys from {:?}", keys.len(), path);
        server = server.with_public_key_lookup(keys);
    }

    let server = Arc::new(server);
    let addr = args.bind_addr();
    info!("Starting git SSH server on {}", addr);
    server
        .listen(&addr)
        .await
        .with_context(|| format!("Failed to start SSH server on {}", addr))?;

    let stopper = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            stopper.stop();
        }
    });

    match server.serve().await {
        Ok(()) | Err(Error::ServerClosed) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
