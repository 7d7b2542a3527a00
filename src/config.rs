//! Configuration file module

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub socket: PathBuf,
    pub device: DeviceConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub queues: u16,
}

impl Config {
    /// Loads a configuration file from disk
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let f = File::open(path)?;
        let cfg: Config =
            serde_yaml::from_reader(f).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(cfg)
    }
}
