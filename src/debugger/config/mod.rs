use crate::debugger::error::Error;
use crate::{muted_error, weak_error};
use serde::Deserialize;
use std::fs::read_to_string;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionConfig {
    pub echo_output: bool,
    pub silent: bool,
    pub observe_every_instruction: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackConfig {
    pub max_frames: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DisassemblyConfig {
    pub decode_on_load: bool,
}

/// Debug session settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub execution: ExecutionConfig,
    pub stack: StackConfig,
    pub disassembly: DisassemblyConfig,
}

impl Default for Config {
    fn default() -> Self {
        let default_config = include_str!("preset/config.toml");
        Self::parse(default_config).expect("should de")
    }
}

impl Config {
    const DEFAULT_PATH: &'static str = ".config/vmstalker/config.toml";

    pub fn parse(data: &str) -> Result<Self, Error> {
        Ok(toml::de::from_str(data)?)
    }

    /// Load config from file, if `path` is `None` use `~/.config/vmstalker/config.toml`.
    /// Return [`None`] on errors.
    pub fn from_file(path: Option<&str>) -> Option<Self> {
        let data = match path {
            None => {
                let path = home::home_dir()?;
                let path = path.join(Self::DEFAULT_PATH);
                muted_error!(read_to_string(path))?
            }
            Some(path) => match read_to_string(path) {
                Ok(data) => data,
                Err(err) => {
                    log::error!(target: "debugger", "Error while load config file: {err}");
                    return None;
                }
            },
        };

        weak_error!(Self::parse(&data))
    }
}
