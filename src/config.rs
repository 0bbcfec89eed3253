//! Settings read from the environment when the session starts.
//!
//! | variable          | values                          | default  |
//! |-------------------|---------------------------------|----------|
//! | `MEMTRACE_SINK`   | `text`, `log`, `off`            | `text`   |
//! | `MEMTRACE_OUTPUT` | `stderr` or a file path         | `stderr` |
//! | `MEMTRACE_REPORT` | file path for the JSON report   | unset    |
//! | `MEMTRACE_LOG`    | `env_logger` filter (`log` sink)| `info`   |

use std::{ffi::OsString, path::PathBuf, str::FromStr};

use thiserror::Error;

pub const SINK_VAR: &str = "MEMTRACE_SINK";
pub const OUTPUT_VAR: &str = "MEMTRACE_OUTPUT";
pub const REPORT_VAR: &str = "MEMTRACE_REPORT";
pub const LOG_VAR: &str = "MEMTRACE_LOG";

pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SinkKind {
    /// One line per event on [`Output`]
    #[default]
    Text,
    /// Through the `log` facade
    Log,
    Off,
}

impl FromStr for SinkKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(SinkKind::Text),
            "log" => Ok(SinkKind::Log),
            "off" | "none" => Ok(SinkKind::Off),
            _ => Err(ConfigError::InvalidSink(s.to_owned())),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Output {
    #[default]
    Stderr,
    File(PathBuf),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {SINK_VAR} `{0}`, expected one of `text`, `log`, `off`")]
    InvalidSink(String),
    #[error("{0} is not valid unicode")]
    NotUnicode(&'static str),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub sink: SinkKind,
    pub output: Output,
    pub report_path: Option<PathBuf>,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sink: SinkKind::default(),
            output: Output::default(),
            report_path: None,
            log_filter: DEFAULT_LOG_FILTER.to_owned(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var_os(name))
    }

    /// Build a config from any variable lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<OsString>,
    {
        let get = |name| lookup(name).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(sink) = get(SINK_VAR) {
            config.sink = sink
                .to_str()
                .ok_or(ConfigError::NotUnicode(SINK_VAR))?
                .parse()?;
        }
        if let Some(output) = get(OUTPUT_VAR) {
            config.output = if output == "stderr" {
                Output::Stderr
            } else {
                Output::File(PathBuf::from(output))
            };
        }
        config.report_path = get(REPORT_VAR).map(PathBuf::from);
        if let Some(filter) = get(LOG_VAR) {
            config.log_filter = filter
                .into_string()
                .map_err(|_| ConfigError::NotUnicode(LOG_VAR))?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&'static str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<_, _> = vars.iter().map(|&(k, v)| (k, OsString::from(v))).collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn nothing_set_is_default() {
        assert_eq!(config(&[]).unwrap(), Config::default());
        assert_eq!(Config::default().log_filter, "info");
    }

    #[test]
    fn reads_every_variable() {
        let config = config(&[
            (SINK_VAR, "LOG"),
            (OUTPUT_VAR, "/tmp/trace.txt"),
            (REPORT_VAR, "/tmp/report.json"),
            (LOG_VAR, "memtrace=warn"),
        ])
        .unwrap();
        assert_eq!(config.sink, SinkKind::Log);
        assert_eq!(config.output, Output::File("/tmp/trace.txt".into()));
        assert_eq!(config.report_path, Some("/tmp/report.json".into()));
        assert_eq!(config.log_filter, "memtrace=warn");
    }

    #[test]
    fn empty_values_are_unset() {
        let config = config(&[(SINK_VAR, ""), (OUTPUT_VAR, ""), (REPORT_VAR, "")]).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn stderr_output_and_off_sink() {
        let config = config(&[(SINK_VAR, " off "), (OUTPUT_VAR, "stderr")]).unwrap();
        assert_eq!(config.sink, SinkKind::Off);
        assert_eq!(config.output, Output::Stderr);
    }

    #[test]
    fn bad_sink_is_rejected() {
        let err = config(&[(SINK_VAR, "syslog")]).unwrap_err();
        assert_eq!(err, ConfigError::InvalidSink("syslog".to_owned()));
        assert_eq!(
            err.to_string(),
            "invalid MEMTRACE_SINK `syslog`, expected one of `text`, `log`, `off`"
        );
    }
}
