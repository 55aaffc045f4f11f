// src/config.rs
use crate::mailbox::DropPolicy;
use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_WEB_ADDR: &str = "0.0.0.0:6969";
pub const DEFAULT_TRUSTED_HOST: &str = "localhost";
pub const DEFAULT_MAILBOX_CAPACITY: usize = 64;
pub const DEFAULT_HUB_QUEUE: usize = 100;
pub const DEFAULT_WATCH_DEBOUNCE_MS: u64 = 1000;
/// Largest per-client mailbox. Every admitted connection allocates one.
pub const MAX_MAILBOX_CAPACITY: usize = 1 << 16;
pub const MAX_HUB_QUEUE: usize = 1 << 16;

/// Command-line arguments for the application.
#[derive(Parser, Debug, Deserialize, Default)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    /// HTTP address to listen on (e.g., "0.0.0.0:6969")
    #[clap(
        short,
        long,
        value_parser,
        help = "HTTP address to listen on (e.g., \"0.0.0.0:6969\")"
    )]
    pub webaddr: Option<String>,

    /// Directory of static files served next to the WebSocket endpoint
    #[clap(
        short,
        long,
        value_parser,
        help = "Directory of static files to serve (built-in viewer if omitted)"
    )]
    pub static_path: Option<PathBuf>,

    /// Hostname WebSocket clients must present in their Origin header
    #[clap(
        short,
        long,
        value_parser,
        help = "Hostname WebSocket clients must present in their Origin header"
    )]
    pub trusted_host: Option<String>,

    /// Pending events kept per client before the drop policy applies
    #[clap(long, value_parser, help = "Pending events kept per client")]
    pub mailbox_capacity: Option<usize>,

    /// Which event to lose when a client's mailbox is full
    #[clap(long, value_enum, help = "Which event to drop when a client falls behind")]
    pub drop_policy: Option<DropPolicy>,

    /// Pending hub requests before producers wait
    #[clap(long, value_parser, help = "Pending hub requests before producers wait")]
    pub hub_queue: Option<usize>,

    /// Debounce window for the folder watcher, in milliseconds
    #[clap(long, value_parser, help = "Debounce window for the folder watcher (ms)")]
    pub watch_debounce_ms: Option<u64>,

    /// Path to a configuration file (e.g., filehub.toml)
    #[clap(
        short,
        long,
        value_parser,
        help = "Path to a configuration file (e.g., filehub.toml)"
    )]
    pub config: Option<PathBuf>,

    /// Directories whose file creations and deletions are broadcast
    #[clap(help = "Directories whose file creations and deletions are broadcast")]
    pub folders: Vec<String>,

    /// Log level (e.g., trace, debug, info, warn, error)
    #[clap(
        long,
        value_parser,
        help = "Log level (e.g., trace, debug, info, warn, error)"
    )]
    pub log_level: Option<String>,
}

/// Configuration loaded from file, environment, or defaults.
#[derive(Deserialize, Serialize, Debug, Default)]
pub struct FileConfig {
    /// Folders to watch
    pub folders: Option<Vec<String>>,
    /// Listen address
    pub webaddr: Option<String>,
    /// Static asset directory
    pub static_path: Option<PathBuf>,
    /// Trusted Origin hostname
    pub trusted_host: Option<String>,
    /// Per-client mailbox size
    pub mailbox_capacity: Option<usize>,
    /// Mailbox overflow behavior
    pub drop_policy: Option<DropPolicy>,
    /// Hub request queue size
    pub hub_queue: Option<usize>,
    /// Watcher debounce in milliseconds
    pub watch_debounce_ms: Option<u64>,
    /// Log level
    pub log_level: Option<String>,
}

/// Errors raised while assembling the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Figment(#[from] figment::Error),
    #[error("{0} must be at least 1")]
    Zero(&'static str),
    #[error("{setting} must be at most {max}")]
    TooLarge { setting: &'static str, max: usize },
    #[error("trusted host must not be empty")]
    EmptyTrustedHost,
}

/// Final application configuration after merging all sources.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP address to listen on
    pub web_addr: String,
    /// Static asset directory, if any
    pub static_path: Option<PathBuf>,
    /// Hostname admitted by the Origin check
    pub trusted_host: String,
    /// Per-client mailbox size
    pub mailbox_capacity: usize,
    /// Mailbox overflow behavior
    pub drop_policy: DropPolicy,
    /// Hub request queue size
    pub hub_queue: usize,
    /// Directories to watch
    pub folders_to_watch: Vec<String>,
    /// Watcher debounce window
    pub watch_debounce: Duration,
    /// Log level
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            web_addr: DEFAULT_WEB_ADDR.to_string(),
            static_path: None,
            trusted_host: DEFAULT_TRUSTED_HOST.to_string(),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            drop_policy: DropPolicy::default(),
            hub_queue: DEFAULT_HUB_QUEUE,
            folders_to_watch: Vec::new(),
            watch_debounce: Duration::from_millis(DEFAULT_WATCH_DEBOUNCE_MS),
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Loads the application configuration by merging CLI, file, environment, and defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merges already-parsed CLI arguments over file, environment, and defaults.
    pub fn from_cli(cli_args: CliArgs) -> Result<Self, ConfigError> {
        let config_file_path = cli_args
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from("filehub.toml"));

        // Default log level from environment variable FILEHUB_LOG_LEVEL, then "info"
        let default_log_level =
            std::env::var("FILEHUB_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let fig = Figment::new()
            .merge(Serialized::defaults(Self::defaults(&default_log_level)))
            .merge(Toml::file(config_file_path).nested())
            .merge(Env::prefixed("FILEHUB_").map(|key| key.as_str().replace("__", ".").into()));

        let merged_config: FileConfig = fig.select("filehub").extract()?;
        Self::resolve(cli_args, merged_config, default_log_level)
    }

    /// The lowest-precedence layer.
    pub fn defaults(log_level: &str) -> FileConfig {
        FileConfig {
            folders: Some(vec![]),
            webaddr: Some(DEFAULT_WEB_ADDR.to_string()),
            static_path: None,
            trusted_host: Some(DEFAULT_TRUSTED_HOST.to_string()),
            mailbox_capacity: Some(DEFAULT_MAILBOX_CAPACITY),
            drop_policy: Some(DropPolicy::default()),
            hub_queue: Some(DEFAULT_HUB_QUEUE),
            watch_debounce_ms: Some(DEFAULT_WATCH_DEBOUNCE_MS),
            log_level: Some(log_level.to_string()),
        }
    }

    /// Applies CLI overrides on top of a merged file/env configuration and validates the result.
    pub fn resolve(
        cli_args: CliArgs,
        merged_config: FileConfig,
        default_log_level: String,
    ) -> Result<Self, ConfigError> {
        let folders_to_watch = if !cli_args.folders.is_empty() {
            cli_args.folders
        } else {
            merged_config.folders.unwrap_or_default()
        };

        let config = AppConfig {
            web_addr: cli_args
                .webaddr
                .or(merged_config.webaddr)
                .unwrap_or_else(|| DEFAULT_WEB_ADDR.to_string()),
            static_path: cli_args.static_path.or(merged_config.static_path),
            trusted_host: cli_args
                .trusted_host
                .or(merged_config.trusted_host)
                .unwrap_or_else(|| DEFAULT_TRUSTED_HOST.to_string()),
            mailbox_capacity: cli_args
                .mailbox_capacity
                .or(merged_config.mailbox_capacity)
                .unwrap_or(DEFAULT_MAILBOX_CAPACITY),
            drop_policy: cli_args
                .drop_policy
                .or(merged_config.drop_policy)
                .unwrap_or_default(),
            hub_queue: cli_args
                .hub_queue
                .or(merged_config.hub_queue)
                .unwrap_or(DEFAULT_HUB_QUEUE),
            folders_to_watch,
            watch_debounce: Duration::from_millis(
                cli_args
                    .watch_debounce_ms
                    .or(merged_config.watch_debounce_ms)
                    .unwrap_or(DEFAULT_WATCH_DEBOUNCE_MS),
            ),
            log_level: cli_args
                .log_level
                .or(merged_config.log_level)
                .unwrap_or(default_log_level),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the hub and mailboxes cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::Zero("mailbox capacity"));
        }
        if self.mailbox_capacity > MAX_MAILBOX_CAPACITY {
            return Err(ConfigError::TooLarge {
                setting: "mailbox capacity",
                max: MAX_MAILBOX_CAPACITY,
            });
        }
        if self.hub_queue == 0 {
            return Err(ConfigError::Zero("hub queue"));
        }
        if self.hub_queue > MAX_HUB_QUEUE {
            return Err(ConfigError::TooLarge {
                setting: "hub queue",
                max: MAX_HUB_QUEUE,
            });
        }
        if self.trusted_host.trim().is_empty() {
            return Err(ConfigError::EmptyTrustedHost);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merged(layers: Vec<FileConfig>) -> FileConfig {
        let mut fig = Figment::new().merge(Serialized::defaults(AppConfig::defaults("info")));
        for layer in layers {
            fig = fig.merge(Serialized::defaults(layer));
        }
        fig.extract().expect("Failed to extract merged config")
    }

    #[test]
    fn defaults_apply_without_overrides() {
        let cli_args = CliArgs::parse_from(["filehub"]);
        let config = AppConfig::resolve(cli_args, merged(vec![]), "info".to_string()).unwrap();
        assert_eq!(config.web_addr, DEFAULT_WEB_ADDR);
        assert_eq!(config.trusted_host, DEFAULT_TRUSTED_HOST);
        assert_eq!(config.mailbox_capacity, DEFAULT_MAILBOX_CAPACITY);
        assert_eq!(config.drop_policy, DropPolicy::Oldest);
        assert_eq!(config.hub_queue, DEFAULT_HUB_QUEUE);
        assert_eq!(config.watch_debounce, Duration::from_millis(1000));
        assert!(config.static_path.is_none());
        assert!(config.folders_to_watch.is_empty());
    }

    #[test]
    fn cli_overrides_file_values() {
        let cli_args = CliArgs::parse_from([
            "filehub",
            "--trusted-host",
            "trusted",
            "--drop-policy",
            "newest",
            "--static-path",
            "/srv/www",
            "/tmp/test1",
            "/tmp/test2",
        ]);
        let file = FileConfig {
            trusted_host: Some("from-file".to_string()),
            webaddr: Some("127.0.0.1:7000".to_string()),
            mailbox_capacity: Some(8),
            folders: Some(vec!["/default/folder".to_string()]),
            ..Default::default()
        };
        let config = AppConfig::resolve(cli_args, merged(vec![file]), "info".to_string()).unwrap();

        assert_eq!(config.trusted_host, "trusted");
        assert_eq!(config.drop_policy, DropPolicy::Newest);
        assert_eq!(config.static_path, Some(PathBuf::from("/srv/www")));
        assert_eq!(config.web_addr, "127.0.0.1:7000");
        assert_eq!(config.mailbox_capacity, 8);
        assert_eq!(config.folders_to_watch, vec!["/tmp/test1", "/tmp/test2"]);
    }

    #[test]
    fn drop_policy_reads_lowercase_names() {
        let fig = Figment::new().merge(Toml::string(
            r#"
            drop_policy = "newest"
            mailbox_capacity = 4
            "#,
        ));
        let file: FileConfig = fig.extract().unwrap();
        assert_eq!(file.drop_policy, Some(DropPolicy::Newest));
        assert_eq!(file.mailbox_capacity, Some(4));
    }

    #[test]
    fn zero_capacities_are_rejected() {
        let cli_args = CliArgs::parse_from(["filehub", "--mailbox-capacity", "0"]);
        let err = AppConfig::resolve(cli_args, merged(vec![]), "info".to_string()).unwrap_err();
        assert_eq!(err.to_string(), "mailbox capacity must be at least 1");

        let cli_args = CliArgs::parse_from(["filehub", "--hub-queue", "0"]);
        assert!(matches!(
            AppConfig::resolve(cli_args, merged(vec![]), "info".to_string()),
            Err(ConfigError::Zero("hub queue"))
        ));
    }

    #[test]
    fn oversized_capacities_are_rejected() {
        let huge = usize::MAX.to_string();
        let cli_args = CliArgs::parse_from(["filehub", "--mailbox-capacity", huge.as_str()]);
        let err = AppConfig::resolve(cli_args, merged(vec![]), "info".to_string()).unwrap_err();
        assert_eq!(err.to_string(), "mailbox capacity must be at most 65536");

        let cli_args = CliArgs::parse_from(["filehub", "--hub-queue", "1000000000"]);
        assert!(matches!(
            AppConfig::resolve(cli_args, merged(vec![]), "info".to_string()),
            Err(ConfigError::TooLarge {
                setting: "hub queue",
                ..
            })
        ));

        let at_limit = MAX_MAILBOX_CAPACITY.to_string();
        let cli_args = CliArgs::parse_from(["filehub", "--mailbox-capacity", at_limit.as_str()]);
        let config = AppConfig::resolve(cli_args, merged(vec![]), "info".to_string()).unwrap();
        assert_eq!(config.mailbox_capacity, MAX_MAILBOX_CAPACITY);
    }

    #[test]
    fn empty_trusted_host_is_rejected() {
        let cli_args = CliArgs::parse_from(["filehub", "--trusted-host", " "]);
        assert!(matches!(
            AppConfig::resolve(cli_args, merged(vec![]), "info".to_string()),
            Err(ConfigError::EmptyTrustedHost)
        ));
    }
}
