// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use broker::conf::Params;
use clap::{Arg, ArgMatches, Command};
use serde::{Deserialize, Serialize};
use tracing::Level;

#[derive(Serialize, Deserialize, Clone, Default)]
pub(crate) struct Config {
    log_level: Option<String>,
    log_type: Option<String>,
    #[serde(default)]
    pub(crate) broker: Params,
}

/// Default log_level.
const DEFAULT_LOG_LEVEL: &str = "info";

/// Default log_type.
const DEFAULT_LOG_TYPE: &str = "coloured";

impl From<&ArgMatches> for Config {
    fn from(matches: &ArgMatches) -> Self {
        let mut config = matches
            .get_one::<String>("config")
            .map_or(Config::default(), |conf_path| {
                let toml =
                    std::fs::read_to_string(conf_path).unwrap_or_else(|e| {
                        panic!("config {conf_path} unreadable: {e}")
                    });
                toml::from_str(&toml).unwrap_or_else(|e| {
                    panic!("config {conf_path} invalid: {e}")
                })
            });

        if let Some(log_level) = matches.get_one::<String>("log-level") {
            config.log_level = Some(log_level.into());
        }

        if let Some(log_type) = matches.get_one::<String>("log-type") {
            config.log_type = Some(log_type.into());
        }

        if let Some(size) = matches.get_one::<u32>("size") {
            config.broker.size = *size;
        }

        if let Some(fanout) = matches.get_one::<u32>("fanout") {
            config.broker.fanout = *fanout;
        }

        if let Some(module_path) = matches.get_one::<String>("module-path") {
            config.broker.module_path = module_path.into();
        }

        config
    }
}

impl Config {
    pub(crate) fn inject_args(command: Command) -> Command {
        command
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LOG")
                    .value_parser([
                        "error", "warn", "info", "debug", "trace",
                    ])
                    .help("Output log level"),
            )
            .arg(
                Arg::new("log-type")
                    .long("log-type")
                    .value_name("LOG_TYPE")
                    .value_parser(["coloured", "plain", "json"])
                    .help("Change the log format accordingly"),
            )
            .arg(
                Arg::new("size")
                    .long("size")
                    .value_name("SIZE")
                    .value_parser(clap::value_parser!(u32))
                    .help("Number of brokers in the instance"),
            )
            .arg(
                Arg::new("fanout")
                    .long("fanout")
                    .value_name("K")
                    .value_parser(clap::value_parser!(u32))
                    .help("Arity of the overlay tree"),
            )
            .arg(
                Arg::new("module-path")
                    .long("module-path")
                    .value_name("PATH")
                    .help("Module search path (colon separated)"),
            )
    }

    pub(crate) fn log_level(&self) -> Level {
        let log_level =
            self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL);
        log_level
            .parse()
            .unwrap_or_else(|e| panic!("invalid log-level: {e}"))
    }

    pub(crate) fn log_type(&self) -> String {
        match &self.log_type {
            Some(log_type) => log_type.into(),
            None => DEFAULT_LOG_TYPE.into(),
        }
    }
}
