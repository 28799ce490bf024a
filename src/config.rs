use clap::Parser;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Process configuration. Every option can also be set through its environment variable.
#[derive(Debug, Clone, Parser)]
#[command(name = "stitch-gateway", version, about = "GraphQL stitching gateway")]
pub struct Config {
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// JSON or YAML file holding the resource group.
    #[arg(long, env = "FS_RESOURCE_REPOSITORY_PATH", default_value = "resources.json")]
    pub resources_path: PathBuf,

    #[arg(long, env = "RESOURCE_UPDATE_INTERVAL", default_value_t = 60_000)]
    pub resource_update_interval_ms: u64,

    /// Base url of the OPA server evaluating `opa` policies.
    #[arg(long, env = "OPA_URL")]
    pub opa_url: Option<String>,

    /// Used by `@rest` and `@gql` fields that set no `timeoutMs`.
    #[arg(long, env = "DEFAULT_UPSTREAM_TIMEOUT", default_value_t = 10_000)]
    pub default_timeout_ms: u64,

    /// A `tracing` filter directive, e.g. `info` or `stitch_gateway=debug`.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }

    pub fn resource_update_interval(&self) -> Duration {
        Duration::from_millis(self.resource_update_interval_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;

    #[test]
    #[serial]
    fn defaults_apply_without_arguments() {
        let config = Config::try_parse_from(["stitch-gateway"]).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.resources_path, PathBuf::from("resources.json"));
        assert_eq!(config.resource_update_interval(), Duration::from_secs(60));
        assert_eq!(config.default_timeout(), Duration::from_secs(10));
        assert_eq!(config.opa_url, None);
        assert!(!config.log_json);
    }

    #[test]
    #[serial]
    fn flags_override_defaults() {
        let config = Config::try_parse_from([
            "stitch-gateway",
            "--port",
            "9000",
            "--opa-url",
            "http://opa:8181",
            "--resources-path",
            "/etc/stitch/resources.yaml",
            "--log-json",
        ])
        .unwrap();
        assert_eq!(config.listen_addr().port(), 9000);
        assert_eq!(config.opa_url.as_deref(), Some("http://opa:8181"));
        assert_eq!(config.resources_path, PathBuf::from("/etc/stitch/resources.yaml"));
        assert!(config.log_json);
    }

    #[test]
    #[serial]
    fn environment_variables_are_read() {
        // SAFETY: serialized with every other test that reads the environment
        unsafe { std::env::set_var("DEFAULT_UPSTREAM_TIMEOUT", "2500") };
        let config = Config::try_parse_from(["stitch-gateway"]);
        unsafe { std::env::remove_var("DEFAULT_UPSTREAM_TIMEOUT") };

        assert_eq!(config.unwrap().default_timeout(), Duration::from_millis(2500));
    }
}
