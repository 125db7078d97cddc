//! Command-line argument parsing with clap.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use timber_logs::{LogError, ShipperConfig, SourceType};

/// Ships PostgreSQL slow-query logs to a Logstash TCP input.
#[derive(Parser, Debug, Clone)]
#[command(name = "timber")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file; flags override its values.
    #[arg(short, long, env = "TIMBER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Where to read PostgreSQL log lines from [default: stdin].
    #[arg(long, value_enum, env = "TIMBER_LOGGER_SOURCE_TYPE")]
    pub logger_source_type: Option<SourceArg>,

    /// Syslog identifier to follow in journald mode [default: postgres].
    #[arg(long, env = "TIMBER_JOURNALD_TAG")]
    pub journald_tag: Option<String>,

    /// Logstash TCP input as host:port; events are only printed when unset.
    #[arg(long, env = "TIMBER_TCP_OUT_URL")]
    pub tcp_out_url: Option<String>,

    /// Consecutive failed writes before backing off [default: 10].
    #[arg(long, env = "TIMBER_RETRY_LIMIT")]
    pub retry_limit: Option<u32>,
}

/// Line source selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceArg {
    /// Read standard input.
    Stdin,
    /// Follow the systemd journal.
    Journald,
}

impl From<SourceArg> for SourceType {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Stdin => Self::Stdin,
            SourceArg::Journald => Self::Journald,
        }
    }
}

impl Cli {
    /// Loads the config file (if any) and applies flag overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded or the merged
    /// configuration is invalid.
    pub fn resolve_config(&self) -> Result<ShipperConfig, LogError> {
        let mut config = match &self.config {
            Some(path) => ShipperConfig::from_file(path)?,
            None => ShipperConfig::default(),
        };

        if let Some(source) = self.logger_source_type {
            config.source_type = source.into();
        }
        if let Some(tag) = &self.journald_tag {
            config.journald_tag.clone_from(tag);
        }
        if let Some(url) = &self.tcp_out_url {
            config.tcp_out_url = Some(url.clone());
        }
        if let Some(limit) = self.retry_limit {
            config.retry_limit = limit;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use test_case::test_case;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("timber").chain(args.iter().copied()))
            .expect("valid arguments")
    }

    #[test]
    fn defaults_without_flags() {
        let config = parse(&[]).resolve_config().expect("valid");
        assert_eq!(config, ShipperConfig::default());
    }

    #[test]
    fn flags_set_values() {
        let cli = parse(&[
            "--logger-source-type",
            "journald",
            "--journald-tag",
            "pg",
            "--tcp-out-url",
            "logstash:5000",
            "--retry-limit",
            "3",
        ]);
        let config = cli.resolve_config().expect("valid");

        assert_eq!(config.source_type, SourceType::Journald);
        assert_eq!(config.journald_tag, "pg");
        assert_eq!(config.tcp_out_url.as_deref(), Some("logstash:5000"));
        assert_eq!(config.retry_limit, 3);
    }

    #[test]
    fn flags_override_file() {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(b"journald_tag = \"from-file\"\nretry_limit = 7\n")
            .expect("write");
        let path = file.path().to_string_lossy().to_string();

        let config = parse(&["--config", &path, "--retry-limit", "2"])
            .resolve_config()
            .expect("valid");

        assert_eq!(config.journald_tag, "from-file");
        assert_eq!(config.retry_limit, 2);
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        let result = parse(&["--tcp-out-url", "no-port"]).resolve_config();
        assert!(matches!(result, Err(LogError::Config(_))));
    }

    #[test_case(&["--logger-source-type", "syslog"] ; "unknown source")]
    #[test_case(&["--retry-limit", "-1"] ; "negative retry limit")]
    fn rejects_bad_flags(args: &[&str]) {
        assert!(Cli::try_parse_from(std::iter::once("timber").chain(args.iter().copied())).is_err());
    }
}
