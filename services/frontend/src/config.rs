// Frontend service configuration sourced from environment variables,
// with optional YAML overrides for ops-managed deployments.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub struct FrontendConfig {
    // Query ingress HTTP listener.
    pub http_bind: SocketAddr,
    // Querier-facing QUIC listener.
    pub rpc_bind: SocketAddr,
    // Admin HTTP listener (/metrics, /ready).
    pub admin_bind: SocketAddr,
    // Proxy mode: when set, queries bypass the queue entirely.
    pub downstream_url: Option<String>,
    // Largest accepted request body; larger bodies get a 413.
    pub max_body_size: usize,
    // Slow-query log threshold; 0 disables the log.
    pub log_queries_longer_than_ms: u64,
    // Per-tenant queue capacity.
    pub max_outstanding_per_tenant: usize,
    // Per-tenant querier cap; 0 lets every querier serve every tenant.
    pub max_queriers_per_tenant: usize,
    // Per-query time limit; 0 means unbounded.
    pub query_timeout_ms: u64,
    // How long queued work may drain on shutdown.
    pub drain_timeout_ms: u64,
    // Max frame size accepted on querier streams.
    pub max_frame_bytes: usize,
    // TLS server name on the self-signed querier-facing certificate.
    pub server_name: String,
}

const DEFAULT_CONFIG_PATH: &str = "/usr/local/quill/frontend.yml";
const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;
const DEFAULT_MAX_OUTSTANDING_PER_TENANT: usize = 100;
const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 5000;
const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct FrontendConfigOverride {
    http_bind: Option<String>,
    rpc_bind: Option<String>,
    admin_bind: Option<String>,
    downstream_url: Option<String>,
    max_body_size: Option<usize>,
    log_queries_longer_than_ms: Option<u64>,
    max_outstanding_per_tenant: Option<usize>,
    max_queriers_per_tenant: Option<usize>,
    query_timeout_ms: Option<u64>,
    drain_timeout_ms: Option<u64>,
    max_frame_bytes: Option<usize>,
    server_name: Option<String>,
}

impl FrontendConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let http_bind = std::env::var("QUILL_HTTP_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse QUILL_HTTP_BIND")?;
        let rpc_bind = std::env::var("QUILL_RPC_BIND")
            .unwrap_or_else(|_| "0.0.0.0:9095".to_string())
            .parse()
            .with_context(|| "parse QUILL_RPC_BIND")?;
        let admin_bind = std::env::var("QUILL_ADMIN_BIND")
            .unwrap_or_else(|_| "0.0.0.0:9090".to_string())
            .parse()
            .with_context(|| "parse QUILL_ADMIN_BIND")?;
        let downstream_url = std::env::var("QUILL_DOWNSTREAM_URL")
            .ok()
            .filter(|value| !value.is_empty());
        let max_body_size = std::env::var("QUILL_MAX_BODY_SIZE")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_BODY_SIZE);
        let log_queries_longer_than_ms = std::env::var("QUILL_LOG_QUERIES_LONGER_THAN_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);
        let max_outstanding_per_tenant = std::env::var("QUILL_MAX_OUTSTANDING_PER_TENANT")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_OUTSTANDING_PER_TENANT);
        let max_queriers_per_tenant = std::env::var("QUILL_MAX_QUERIERS_PER_TENANT")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(0);
        let query_timeout_ms = std::env::var("QUILL_QUERY_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);
        let drain_timeout_ms = std::env::var("QUILL_DRAIN_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_DRAIN_TIMEOUT_MS);
        let max_frame_bytes = std::env::var("QUILL_MAX_FRAME_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES);
        let server_name =
            std::env::var("QUILL_SERVER_NAME").unwrap_or_else(|_| "localhost".to_string());
        Ok(Self {
            http_bind,
            rpc_bind,
            admin_bind,
            downstream_url,
            max_body_size,
            log_queries_longer_than_ms,
            max_outstanding_per_tenant,
            max_queriers_per_tenant,
            query_timeout_ms,
            drain_timeout_ms,
            max_frame_bytes,
            server_name,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        let override_path = std::env::var("QUILL_FRONTEND_CONFIG").ok();
        let config_path = override_path
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        let contents = match fs::read_to_string(&config_path) {
            Ok(contents) => Some(contents),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if override_path.is_some() {
                    return Err(err)
                        .with_context(|| format!("read QUILL_FRONTEND_CONFIG: {config_path}"));
                }
                None
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read frontend config: {config_path}"));
            }
        };
        if let Some(contents) = contents {
            let override_cfg: FrontendConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse frontend config yaml")?;
            if let Some(value) = override_cfg.http_bind {
                config.http_bind = value.parse().with_context(|| "parse http_bind")?;
            }
            if let Some(value) = override_cfg.rpc_bind {
                config.rpc_bind = value.parse().with_context(|| "parse rpc_bind")?;
            }
            if let Some(value) = override_cfg.admin_bind {
                config.admin_bind = value.parse().with_context(|| "parse admin_bind")?;
            }
            if let Some(value) = override_cfg.downstream_url {
                config.downstream_url = Some(value).filter(|value| !value.is_empty());
            }
            if let Some(value) = override_cfg.max_body_size
                && value > 0
            {
                config.max_body_size = value;
            }
            if let Some(value) = override_cfg.log_queries_longer_than_ms {
                config.log_queries_longer_than_ms = value;
            }
            if let Some(value) = override_cfg.max_outstanding_per_tenant
                && value > 0
            {
                config.max_outstanding_per_tenant = value;
            }
            if let Some(value) = override_cfg.max_queriers_per_tenant {
                config.max_queriers_per_tenant = value;
            }
            if let Some(value) = override_cfg.query_timeout_ms {
                config.query_timeout_ms = value;
            }
            if let Some(value) = override_cfg.drain_timeout_ms
                && value > 0
            {
                config.drain_timeout_ms = value;
            }
            if let Some(value) = override_cfg.max_frame_bytes
                && value > 0
            {
                config.max_frame_bytes = value;
            }
            if let Some(value) = override_cfg.server_name {
                config.server_name = value;
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "QUILL_HTTP_BIND",
            "QUILL_RPC_BIND",
            "QUILL_ADMIN_BIND",
            "QUILL_DOWNSTREAM_URL",
            "QUILL_MAX_BODY_SIZE",
            "QUILL_LOG_QUERIES_LONGER_THAN_MS",
            "QUILL_MAX_OUTSTANDING_PER_TENANT",
            "QUILL_MAX_QUERIERS_PER_TENANT",
            "QUILL_QUERY_TIMEOUT_MS",
            "QUILL_DRAIN_TIMEOUT_MS",
            "QUILL_MAX_FRAME_BYTES",
            "QUILL_SERVER_NAME",
            "QUILL_FRONTEND_CONFIG",
        ] {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    #[serial]
    fn defaults_are_sane() {
        clear_env();
        let config = FrontendConfig::from_env().expect("config");
        assert_eq!(config.max_body_size, DEFAULT_MAX_BODY_SIZE);
        assert_eq!(config.max_outstanding_per_tenant, 100);
        assert_eq!(config.log_queries_longer_than_ms, 0);
        assert!(config.downstream_url.is_none());
        assert_eq!(config.server_name, "localhost");
    }

    #[test]
    #[serial]
    fn env_overrides_apply() {
        clear_env();
        unsafe {
            std::env::set_var("QUILL_MAX_BODY_SIZE", "1");
            std::env::set_var("QUILL_DOWNSTREAM_URL", "http://127.0.0.1:1234");
            std::env::set_var("QUILL_MAX_OUTSTANDING_PER_TENANT", "7");
        }
        let config = FrontendConfig::from_env().expect("config");
        assert_eq!(config.max_body_size, 1);
        assert_eq!(
            config.downstream_url.as_deref(),
            Some("http://127.0.0.1:1234")
        );
        assert_eq!(config.max_outstanding_per_tenant, 7);
        clear_env();
    }

    #[test]
    #[serial]
    fn yaml_overrides_env() {
        clear_env();
        let dir = std::env::temp_dir().join("quill-frontend-config-test");
        fs::create_dir_all(&dir).expect("tmp dir");
        let path = dir.join("frontend.yml");
        fs::write(
            &path,
            "max_outstanding_per_tenant: 3\nlog_queries_longer_than_ms: 250\n",
        )
        .expect("write yaml");
        unsafe { std::env::set_var("QUILL_FRONTEND_CONFIG", &path) };
        let config = FrontendConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.max_outstanding_per_tenant, 3);
        assert_eq!(config.log_queries_longer_than_ms, 250);
        clear_env();
    }

    #[test]
    #[serial]
    fn explicit_missing_config_file_is_an_error() {
        clear_env();
        unsafe { std::env::set_var("QUILL_FRONTEND_CONFIG", "/definitely/not/there.yml") };
        let err = FrontendConfig::from_env_or_yaml().expect_err("missing file");
        assert!(err.to_string().contains("QUILL_FRONTEND_CONFIG"));
        clear_env();
    }
}
