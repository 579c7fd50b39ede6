// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use anyhow::Result;
use clap::Parser;
use sisdk_core::SisdkConfig;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "SISDK topic broker", long_about = None)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (overrides config file)
    #[arg(long, env = "SISDK_BROKER_ADDR")]
    listen: Option<String>,

    /// Password clients must present (overrides config file)
    #[arg(long, env = "SISDK_BROKER_PASSWORD")]
    password: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sisdk_bus=info,sisdk_broker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let mut config = SisdkConfig::load(args.config)?;

    // Apply CLI overrides
    if let Some(listen) = args.listen {
        config.broker.listen_addr = listen;
    }
    if let Some(password) = args.password {
        config.broker.password = Some(password);
    }

    tracing::info!(addr = %config.broker.listen_addr, "Starting SISDK broker");
    sisdk_bus::run_broker(&config.broker)?;
    Ok(())
}
