// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Params {
    /// This broker's position in the instance.
    #[serde(default)]
    pub rank: u32,

    /// Number of brokers in the instance.
    #[serde(default = "default_size")]
    pub size: u32,

    /// Arity of the overlay tree.
    #[serde(default = "default_fanout")]
    pub fanout: u32,

    /// Colon-separated search path for loadable service modules.
    #[serde(default)]
    pub module_path: String,

    /// Modules loaded at startup, resolved against `module_path`.
    #[serde(default)]
    pub preload: Vec<String>,

    /// Userid the broker stamps on messages sent through its own handle.
    #[serde(default)]
    pub userid: u32,

    /// Whether the broker accepts forwarded client requests immediately.
    /// An embedding state machine may keep this off and flip it through
    /// the handle once bootstrap completes.
    #[serde(default = "default_start_online")]
    pub start_online: bool,

    /// How long shutdown waits for modules to drain before giving up.
    #[serde(with = "humantime_serde", default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,
}

const fn default_size() -> u32 {
    1
}
const fn default_fanout() -> u32 {
    2
}
const fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}
const fn default_start_online() -> bool {
    true
}

impl Default for Params {
    fn default() -> Self {
        Self {
            rank: 0,
            size: default_size(),
            fanout: default_fanout(),
            module_path: String::new(),
            preload: vec![],
            userid: 0,
            start_online: default_start_online(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rank: {}, size: {}, fanout: {}, preload: {:?}",
            self.rank, self.size, self.fanout, self.preload
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let params: Params = toml::from_str("").expect("valid conf");
        assert_eq!(params.rank, 0);
        assert_eq!(params.size, 1);
        assert_eq!(params.fanout, 2);
        assert_eq!(params.shutdown_grace, Duration::from_secs(30));
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "rank = 1\nsize = 2\npreload = [\"kvs\"]\n")
            .expect("write conf");
        let toml = std::fs::read_to_string(file.path()).expect("read conf");
        let params: Params = toml::from_str(&toml).expect("valid conf");
        assert_eq!(params.rank, 1);
        assert_eq!(params.size, 2);
        assert_eq!(params.preload, vec!["kvs"]);
    }

    #[test]
    fn test_explicit_values() {
        let params: Params = toml::from_str(
            r#"
            rank = 3
            size = 16
            fanout = 4
            module_path = "/usr/lib/canopy/modules"
            preload = ["kvs", "job-manager"]
            shutdown_grace = "5s"
            "#,
        )
        .expect("valid conf");
        assert_eq!(params.rank, 3);
        assert_eq!(params.fanout, 4);
        assert_eq!(params.preload, vec!["kvs", "job-manager"]);
        assert_eq!(params.shutdown_grace, Duration::from_secs(5));
    }
}
