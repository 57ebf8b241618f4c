// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use broker::conf::Params;
use broker::modules::DsoLoader;
use broker::overlay::MemOverlay;
use broker::Broker;
use clap::{Arg, ArgMatches, Command};
use tokio::task::JoinSet;
use tracing::error;

use crate::config::Config;

mod config;

pub fn main() -> anyhow::Result<()> {
    let args = args();
    let config = Config::from(&args);

    configure_log(&config)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
        .block_on(async {
            // A single-host instance: every rank lives in this process,
            // linked by the in-memory overlay. Modules are loaded from
            // shared objects on the configured search path.
            let base = config.broker.clone();
            let mut set = JoinSet::new();
            for overlay in
                MemOverlay::instance(base.size, base.fanout)
            {
                let conf = Params {
                    rank: overlay.rank(),
                    ..base.clone()
                };
                let broker =
                    Broker::new(conf, overlay, Box::new(DsoLoader));
                set.spawn(broker.run());
            }

            let mut failed = false;
            while let Some(res) = set.join_next().await {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!("broker terminated with err: {}", e);
                        failed = true;
                    }
                    Err(e) => {
                        error!("broker task failed: {}", e);
                        failed = true;
                    }
                }
            }
            if failed {
                std::process::exit(1);
            }
            Ok(())
        })
}

fn args() -> ArgMatches {
    let command = Command::new("canopy-broker")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Canopy per-node message broker.")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .env("CANOPY_CONFIG_TOML")
                .help("Configuration file path")
                .required(false),
        );

    let command = Config::inject_args(command);
    command.get_matches()
}

fn configure_log(config: &Config) -> anyhow::Result<()> {
    let log = config.log_level();

    // Generate a subscriber with the desired log level.
    let subscriber =
        tracing_subscriber::fmt::Subscriber::builder().with_max_level(log);

    // Set the subscriber as global so it applies to every thread for the
    // remainder of the program.
    match config.log_type().as_str() {
        "json" => {
            let subscriber = subscriber.json().flatten_event(true).finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        "plain" => {
            let subscriber = subscriber.with_ansi(false).finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        "coloured" => {
            let subscriber = subscriber.finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        _ => unreachable!(),
    };
    Ok(())
}
