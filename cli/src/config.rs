use anyhow::{Context, Result};
use clap::Parser;
use lib_signalflow::{ClientOptions, ExecuteRequest};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "signalflow.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Run a SignalFlow program and log its metadata and data", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(help = "SignalFlow program text, e.g. \"data('cpu.utilization').publish()\".")]
    pub program: Option<String>,

    #[clap(long, env = "SIGNALFLOW_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "SIGNALFLOW_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "SIGNALFLOW_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "SIGNALFLOW_REALM", help = "Realm to connect to, e.g. us1.")]
    pub realm: Option<String>,

    #[clap(long, env = "SIGNALFLOW_STREAM_URL", help = "Full stream URL; overrides the realm.")]
    pub stream_url: Option<String>,

    #[clap(long, env = "SIGNALFLOW_ACCESS_TOKEN", hide_env_values = true, help = "Access token used to authenticate.")]
    pub access_token: Option<String>,

    #[clap(long, env = "SIGNALFLOW_START_MS", help = "Start of the time range, epoch milliseconds.")]
    pub start_ms: Option<i64>,

    #[clap(long, env = "SIGNALFLOW_STOP_MS", help = "End of the time range, epoch milliseconds.")]
    pub stop_ms: Option<i64>,

    #[clap(long, env = "SIGNALFLOW_RESOLUTION_MS", help = "Requested resolution in milliseconds.")]
    pub resolution_ms: Option<u64>,

    #[clap(long, env = "SIGNALFLOW_MAX_DELAY_MS", help = "Maximum wait for late data in milliseconds.")]
    pub max_delay_ms: Option<u64>,

    #[clap(long, env = "SIGNALFLOW_IMMEDIATE", help = "Emit results for the current period immediately.")]
    pub immediate: Option<bool>,

    #[clap(long, env = "SIGNALFLOW_METADATA_TIMEOUT_MS", help = "How long to wait for job metadata, in milliseconds.")]
    pub metadata_timeout_ms: Option<u64>,

    #[clap(long, env = "SIGNALFLOW_READ_TIMEOUT_MS", help = "Socket silence tolerated before reconnecting, in milliseconds.")]
    pub read_timeout_ms: Option<u64>,

    #[clap(long, env = "SIGNALFLOW_RECONNECT_DELAY_MS", help = "Pause before each reconnect attempt, in milliseconds.")]
    pub reconnect_delay_ms: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            program: other.program.or(self.program),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            realm: other.realm.or(self.realm),
            stream_url: other.stream_url.or(self.stream_url),
            access_token: other.access_token.or(self.access_token),
            start_ms: other.start_ms.or(self.start_ms),
            stop_ms: other.stop_ms.or(self.stop_ms),
            resolution_ms: other.resolution_ms.or(self.resolution_ms),
            max_delay_ms: other.max_delay_ms.or(self.max_delay_ms),
            immediate: other.immediate.or(self.immediate),
            metadata_timeout_ms: other.metadata_timeout_ms.or(self.metadata_timeout_ms),
            read_timeout_ms: other.read_timeout_ms.or(self.read_timeout_ms),
            reconnect_delay_ms: other.reconnect_delay_ms.or(self.reconnect_delay_ms),
        }
    }

    fn defaults() -> Config {
        Config {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            ..Default::default()
        }
    }

    /// Library options described by this config. Unset values keep the
    /// library defaults.
    pub fn client_options(&self) -> ClientOptions {
        let mut options = ClientOptions::new();
        if let Some(realm) = &self.realm {
            options = options.with_realm(realm);
        }
        if let Some(url) = &self.stream_url {
            options = options.with_stream_url(url);
        }
        if let Some(token) = &self.access_token {
            options = options.with_access_token(token);
        }
        if let Some(ms) = self.metadata_timeout_ms {
            options = options.with_metadata_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.read_timeout_ms {
            options = options.with_read_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.reconnect_delay_ms {
            options = options.with_reconnect_delay(Duration::from_millis(ms));
        }
        options
    }

    pub fn execute_request(&self) -> Result<ExecuteRequest> {
        let program = self
            .program
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .context("no SignalFlow program given (pass it as an argument or set `program` in the config file)")?;

        let mut request = ExecuteRequest::new(program);
        request.start = self.start_ms;
        request.stop = self.stop_ms;
        request.resolution = self.resolution_ms;
        request.max_delay = self.max_delay_ms;
        request.immediate = self.immediate;
        Ok(request)
    }
}

/// Reads a JSON config file. A missing file yields `None`; an unreadable or
/// malformed one is reported and ignored.
fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<Config>(&text) {
            Ok(config) => Some(config),
            Err(e) => {
                log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Layers defaults, the config file and the parsed CLI/env values, later
/// layers winning.
pub fn resolve_config(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current = current.merge(file_config);
    }
    current.merge(cli)
}

/// Loads `.env`, then resolves the full configuration from every source.
pub fn load_config() -> Config {
    // Values from .env only fill variables that are not already set.
    let _ = dotenvy::dotenv();
    resolve_config(Config::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_values_fill_gaps_and_cli_wins() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "program": "data('a').publish()", "realm": "eu0", "resolutionMs": 60000, "logLevel": "debug" }}"#
        )
        .unwrap();

        let cli = Config {
            config_path: Some(file.path().to_path_buf()),
            realm: Some("us2".to_string()),
            ..Default::default()
        };
        let config = resolve_config(cli);

        assert_eq!(config.realm.as_deref(), Some("us2"));
        assert_eq!(config.program.as_deref(), Some("data('a').publish()"));
        assert_eq!(config.resolution_ms, Some(60000));
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.log_dir, Some(PathBuf::from("./logs")));
    }

    #[test]
    fn malformed_file_is_ignored() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();

        let cli = Config { config_path: Some(file.path().to_path_buf()), ..Default::default() };
        assert_eq!(resolve_config(cli.clone()), Config::defaults().merge(cli));
    }

    #[test]
    fn execute_request_needs_a_program() {
        let config = Config { program: Some("   ".to_string()), ..Default::default() };
        assert!(config.execute_request().is_err());

        let config = Config {
            program: Some("data('a').publish()".to_string()),
            resolution_ms: Some(1000),
            immediate: Some(true),
            ..Default::default()
        };
        let request = config.execute_request().unwrap();
        assert_eq!(request.program, "data('a').publish()");
        assert_eq!(request.resolution, Some(1000));
        assert_eq!(request.immediate, Some(true));
        assert_eq!(request.channel, None);
    }

    #[test]
    fn client_options_reject_zero_timeouts_on_validation() {
        let config = Config { metadata_timeout_ms: Some(0), ..Default::default() };
        assert!(config.client_options().validate().is_err());

        let config = Config { realm: Some("us1".to_string()), ..Default::default() };
        assert_eq!(
            config.client_options().validate().unwrap().as_str(),
            "wss://stream.us1.signalfx.com/v2/signalflow/connect"
        );
    }
}
