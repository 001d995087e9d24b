use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use tether::DEFAULT_PORT;

#[derive(Serialize, Deserialize)]
pub struct Server {
    pub address: Option<String>,
    pub kill_on_disconnect: bool,
}

#[derive(Serialize, Deserialize)]
pub struct Log {
    /// TOML snippet handed to the logger builder, in `sloggers` form.
    pub config: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct HostConfig {
    pub server: Server,
    pub log: Log,
}

impl Default for HostConfig {
    fn default() -> HostConfig {
        HostConfig {
            server: Server {
                address: Some(format!("0.0.0.0:{}", DEFAULT_PORT)),
                kill_on_disconnect: false,
            },
            log: Log { config: None },
        }
    }
}

impl HostConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<HostConfig, String> {
        serdeconv::from_toml_file(path).map_err(|err| err.to_string())
    }
}
