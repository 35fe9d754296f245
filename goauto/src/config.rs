// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of goauto

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use log::LevelFilter;
use serde::Deserialize;

use crate::directories::{BPFFS_ROOT, CFGPATH_GOAUTO_CONFIG, DEFAULT_BYTECODE_DIR};
use crate::errors::ParseError;

pub const ENV_TARGET_EXE: &str = "OTEL_GO_AUTO_TARGET_EXE";
pub const ENV_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";
pub const ENV_OTLP_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
pub const ENV_TRACES_SAMPLER: &str = "OTEL_TRACES_SAMPLER";
pub const ENV_TRACES_SAMPLER_ARG: &str = "OTEL_TRACES_SAMPLER_ARG";
pub const ENV_LOG_LEVEL: &str = "OTEL_LOG_LEVEL";

#[derive(Debug, Clone, PartialEq)]
pub enum Sampler {
    AlwaysOn,
    AlwaysOff,
    TraceIdRatio(f64),
}

impl Default for Sampler {
    fn default() -> Self {
        Sampler::AlwaysOn
    }
}

impl Sampler {
    fn parse(name: &str, arg: Option<&str>) -> Result<Self, ParseError> {
        match name {
            "always_on" => Ok(Sampler::AlwaysOn),
            "always_off" => Ok(Sampler::AlwaysOff),
            "traceidratio" => {
                let fraction = arg
                    .map(|a| {
                        a.parse::<f64>().map_err(|_| ParseError::InvalidSampler {
                            value: format!("{name}={a}"),
                        })
                    })
                    .transpose()?
                    .unwrap_or(1.0);
                Ok(Sampler::TraceIdRatio(fraction))
            }
            _ => Err(ParseError::InvalidSampler {
                value: name.to_string(),
            }),
        }
    }
}

#[derive(Debug, Deserialize, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Dpanic,
    Panic,
    Fatal,
}

impl LogLevel {
    pub fn as_filter(&self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warn => LevelFilter::Warn,
            // The panic-flavored zap levels all map onto error.
            LogLevel::Error | LogLevel::Dpanic | LogLevel::Panic | LogLevel::Fatal => {
                LevelFilter::Error
            }
        }
    }
}

impl FromStr for LogLevel {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "dpanic" => Ok(LogLevel::Dpanic),
            "panic" => Ok(LogLevel::Panic),
            "fatal" => Ok(LogLevel::Fatal),
            _ => Err(ParseError::InvalidLogLevel {
                value: s.to_string(),
            }),
        }
    }
}

/// Runtime configuration, built from the optional config file with the
/// environment layered on top.
#[derive(Debug, Clone)]
pub struct Config {
    pub target_exe: Option<String>,
    pub service_name: Option<String>,
    pub otlp_endpoint: Option<String>,
    pub sampler: Sampler,
    pub log_level: LogLevel,
    pub bytecode_dir: PathBuf,
    pub bpffs_root: PathBuf,
    /// Log finished spans instead of exporting them. Debug aid.
    pub stdout_sink: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_exe: None,
            service_name: None,
            otlp_endpoint: None,
            sampler: Sampler::default(),
            log_level: LogLevel::Info,
            bytecode_dir: PathBuf::from(DEFAULT_BYTECODE_DIR),
            bpffs_root: PathBuf::from(BPFFS_ROOT),
            stdout_sink: false,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    target_exe: Option<String>,
    service_name: Option<String>,
    otlp_endpoint: Option<String>,
    sampler: Option<String>,
    sampler_arg: Option<f64>,
    log_level: Option<LogLevel>,
    bytecode_dir: Option<PathBuf>,
    bpffs_root: Option<PathBuf>,
    stdout_sink: Option<bool>,
}

impl FromStr for Config {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let file: FileConfig = toml::from_str(s)?;
        let defaults = Config::default();
        let sampler = match file.sampler {
            Some(name) => {
                Sampler::parse(&name, file.sampler_arg.map(|a| a.to_string()).as_deref())?
            }
            None => defaults.sampler,
        };
        Ok(Config {
            target_exe: file.target_exe,
            service_name: file.service_name,
            otlp_endpoint: file.otlp_endpoint,
            sampler,
            log_level: file.log_level.unwrap_or(defaults.log_level),
            bytecode_dir: file.bytecode_dir.unwrap_or(defaults.bytecode_dir),
            bpffs_root: file.bpffs_root.unwrap_or(defaults.bpffs_root),
            stdout_sink: file.stdout_sink.unwrap_or(false),
        })
    }
}

impl Config {
    /// Read the config file, falling back to defaults when it is absent
    /// or malformed, then overlay the process environment.
    pub fn from_env() -> Result<Self, ParseError> {
        let mut config = if let Ok(c) = std::fs::read_to_string(CFGPATH_GOAUTO_CONFIG) {
            c.parse::<Config>().unwrap_or_else(|_| {
                log::warn!("Unable to parse config file, using defaults");
                Config::default()
            })
        } else {
            Config::default()
        };
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ParseError> {
        if let Ok(exe) = env::var(ENV_TARGET_EXE) {
            self.target_exe = Some(exe);
        }
        if let Ok(name) = env::var(ENV_SERVICE_NAME) {
            self.service_name = Some(name);
        }
        if let Ok(endpoint) = env::var(ENV_OTLP_ENDPOINT) {
            self.otlp_endpoint = Some(endpoint);
        }
        if let Ok(sampler) = env::var(ENV_TRACES_SAMPLER) {
            let arg = env::var(ENV_TRACES_SAMPLER_ARG).ok();
            self.sampler = Sampler::parse(&sampler, arg.as_deref())?;
        }
        if let Ok(level) = env::var(ENV_LOG_LEVEL) {
            self.log_level = level.parse()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_config_from_invalid_string() {
        assert!(Config::from_str("i am a teapot").is_err());
    }

    #[test]
    fn test_config_file() {
        let input = r#"
        target_exe = "/usr/bin/frontend"
        sampler = "traceidratio"
        sampler_arg = 0.5
        log_level = "debug"
        "#;
        let config: Config = input.parse().expect("error parsing toml input");
        assert_eq!(config.target_exe.as_deref(), Some("/usr/bin/frontend"));
        assert_eq!(config.sampler, Sampler::TraceIdRatio(0.5));
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.bpffs_root, PathBuf::from(BPFFS_ROOT));
    }

    #[test]
    fn test_invalid_sampler() {
        let input = r#"sampler = "sometimes""#;
        assert!(input.parse::<Config>().is_err());
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(LogLevel::Debug.as_filter(), LevelFilter::Debug);
        assert_eq!(LogLevel::Fatal.as_filter(), LevelFilter::Error);
        assert!("verbose".parse::<LogLevel>().is_err());
        assert_eq!("dpanic".parse::<LogLevel>().unwrap(), LogLevel::Dpanic);
    }
}
