// This file is part of xgq, a command-queue coordinator that schedules compute-unit work on FPGA accelerators.
//
// Copyright 2025 Canonical Ltd.
//
// SPDX-License-Identifier: GPL-3.0-only
//
// xgq is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License version 3, as published by the Free Software Foundation.
//
// xgq is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranties of MERCHANTABILITY, SATISFACTORY QUALITY, or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with this program.  If not, see http://www.gnu.org/licenses/.

mod identify;
mod log_page;
mod sim;
mod soak;

use crate::identify::identify_handler;
use crate::log_page::log_page_handler;
use crate::sim::SimulatedDevice;
use crate::soak::soak_handler;
use clap::{Parser, Subcommand, arg, command};
use log::debug;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use xgq::config::CoordinatorConfig;
use xgq::session::SessionKind;

#[derive(Parser, Debug)]
#[command(name = "xgq")]
#[command(bin_name = "xgq")]
struct Cli {
    #[arg(
        long = "config",
        help = r#"TOML file to configure the coordinator with.
When omitted, /etc/xgq/config.toml is layered over /usr/lib/xgq/config.toml
and the built in defaults."#
    )]
    config: Option<PathBuf>,
    #[arg(long, default_value_t = 4, help = "Number of compute units of the simulated device")]
    units: u32,
    #[arg(long, default_value_t = 5000, help = "Timeout of every command in milliseconds")]
    timeout_ms: u64,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the controller version
    Identify,
    /// Print the controller's firmware log
    LogPage,
    /// Run concurrent submitters against one channel
    Soak {
        #[arg(long, default_value_t = 4)]
        submitters: u32,
        #[arg(long, default_value_t = 1000)]
        commands: u32,
        #[arg(long, default_value_t = 16)]
        payload_words: usize,
    },
    /// Print the configuration the other commands would use
    Config,
}

fn load_config(path: &Option<PathBuf>) -> Result<CoordinatorConfig, Box<dyn Error>> {
    Ok(match path {
        Some(path) => CoordinatorConfig::from_file(path)?,
        None => CoordinatorConfig::load(),
    })
}

/// Entry point of the xgq command line tool.
///
/// # Environment Variables
///
/// - `RUST_LOG` - Controls logging level (`trace`, `debug`, `info`, `warn`, `error`
///   or `off`). Defaults to `info`
///
/// # Examples
///
/// ```bash
/// xgq_cli identify
/// RUST_LOG=debug xgq_cli --units 8 soak --submitters 16
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    debug!("parsed cli command with {cli:?}");
    let config = load_config(&cli.config)?;
    let timeout = Duration::from_millis(cli.timeout_ms);

    let result = match cli.command {
        Commands::Identify => {
            let device = SimulatedDevice::open(config, cli.units, SessionKind::Admin)?;
            identify_handler(&device, timeout)?
        }
        Commands::LogPage => {
            let device = SimulatedDevice::open(config, cli.units, SessionKind::Admin)?;
            log_page_handler(&device, timeout)?
        }
        Commands::Soak {
            submitters,
            commands,
            payload_words,
        } => {
            let device = Arc::new(SimulatedDevice::open(config, cli.units, SessionKind::Kernel)?);
            soak_handler(device, submitters, commands, payload_words, timeout).await?
        }
        Commands::Config => format!("{config:#?}"),
    };
    println!("{result}");
    Ok(())
}
