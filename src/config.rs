//! Environment-driven configuration.
//!
//! All settings come from `VIZGATE_*` environment variables (a `.env` file is
//! honored via dotenvy); the binaries add `--address`/`--port` overrides on
//! top. Required variables are validated up front so a misconfigured process
//! dies before it binds a socket.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Everything the two services need, parsed and validated.
#[derive(Debug, Clone)]
pub struct Settings {
    pub log_level: String,
    /// Default bind port for the scheduler.
    pub master_port: u16,
    /// Default bind port for the proxy.
    pub slave_port: u16,
    pub tls: TlsConfig,
    pub registry: RegistryConfig,
    /// Drop and recreate the registry schema at scheduler startup.
    pub recreate_registry: bool,
    pub allocator: AllocatorConfig,
    pub auth: AuthConfig,
    /// Session lifetime applied to new jobs.
    pub job_duration: chrono::Duration,
    /// Reaper sweep period.
    pub cleanup_period: Duration,
    /// Base URL clients use to reach the proxy, without a trailing slash.
    pub proxy_base_url: String,
    /// Proxy target port for the `renderer` service.
    pub renderer_port: u16,
    /// Proxy target port for the `backend` service.
    pub backend_port: u16,
}

/// Paths to the TLS material. The services themselves speak plain HTTP;
/// these are handed to whatever terminates TLS in front of them.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Which durable store holds the job registry.
#[derive(Debug, Clone)]
pub enum RegistryConfig {
    Postgres(PostgresConfig),
    DynamoDb(DynamoConfig),
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// `host` or `host:port`.
    pub host: String,
    pub name: String,
    pub user: String,
    pub password: SecretString,
    pub pool_size: usize,
    pub table: String,
}

#[derive(Debug, Clone)]
pub struct DynamoConfig {
    pub table: String,
}

/// Which cluster adapter allocates jobs.
#[derive(Debug, Clone)]
pub enum AllocatorConfig {
    Unicore(UnicoreConfig),
    Ecs(EcsConfig),
    Test,
}

#[derive(Debug, Clone)]
pub struct UnicoreConfig {
    /// REST core URL, without a trailing slash.
    pub endpoint: String,
    /// Extra root CA (PEM) trusted for outbound calls, when the file exists.
    pub ca_file: PathBuf,
    /// DNS suffix of compute nodes, used to pick the hostname out of job output.
    pub dns_suffix: String,
    /// Optional JSON file overriding the builtin use-case templates.
    pub use_cases_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct EcsConfig {
    pub task_definition: String,
    pub cluster: String,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub capacity_provider: String,
    /// Container receiving the per-project environment overrides.
    pub container: String,
    /// Bucket mounted into the task as `S3_BUCKET_PATH`.
    pub bucket: String,
    /// Base path for `FUSE_MOUNT_POINT`.
    pub mount_point: String,
    /// Port probed for readiness on the task's private IP.
    pub health_port: u16,
}

/// Identity provider settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub enabled: bool,
    /// User-info endpoint resolving a bearer token to an email.
    pub user_info_url: String,
    /// Value of the `Host` header sent to the user-info endpoint.
    pub host: String,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let registry = match env_or("VIZGATE_REGISTRY_BACKEND", "postgres").as_str() {
            "postgres" => RegistryConfig::Postgres(PostgresConfig {
                host: env_or("VIZGATE_REGISTRY_HOST", "localhost:5432"),
                name: require("VIZGATE_REGISTRY_NAME")?,
                user: require("VIZGATE_REGISTRY_USER")?,
                password: SecretString::from(require("VIZGATE_REGISTRY_PASSWORD")?),
                pool_size: parsed("VIZGATE_REGISTRY_POOL_SIZE", 8usize)?,
                table: env_or("VIZGATE_REGISTRY_TABLE", "jobs"),
            }),
            "dynamodb" => RegistryConfig::DynamoDb(DynamoConfig {
                table: env_or("VIZGATE_REGISTRY_TABLE", "jobs"),
            }),
            other => {
                return Err(ConfigError::Invalid {
                    key: "VIZGATE_REGISTRY_BACKEND",
                    reason: format!("unknown backend {other}"),
                });
            }
        };

        let allocator = match env_or("VIZGATE_JOB_ALLOCATOR", "UNICORE").as_str() {
            "UNICORE" => AllocatorConfig::Unicore(UnicoreConfig {
                endpoint: require("VIZGATE_UNICORE_ENDPOINT")?
                    .trim_end_matches('/')
                    .to_string(),
                ca_file: PathBuf::from(env_or("VIZGATE_UNICORE_CA_FILE", "/tmp/ca.pem")),
                dns_suffix: require("VIZGATE_UNICORE_DNS_SUFFIX")?,
                use_cases_file: env_var("VIZGATE_USE_CASES_FILE").map(PathBuf::from),
            }),
            "AWS" => AllocatorConfig::Ecs(EcsConfig {
                task_definition: require("VIZGATE_ECS_TASK_DEFINITION")?,
                cluster: env_or("VIZGATE_ECS_CLUSTER", "viz_ecs_cluster"),
                subnets: parse_list(&require("VIZGATE_ECS_SUBNETS")?),
                security_groups: parse_list(&require("VIZGATE_ECS_SECURITY_GROUPS")?),
                capacity_provider: env_or("VIZGATE_ECS_CAPACITY_PROVIDER", "viz_ECS_CapacityProvider"),
                container: env_or("VIZGATE_ECS_CONTAINER", "renderer"),
                bucket: require("VIZGATE_ECS_BUCKET")?,
                mount_point: env_or("VIZGATE_ECS_MOUNT_POINT", "/sbo/data"),
                health_port: parsed("VIZGATE_HEALTH_PORT", 8000u16)?,
            }),
            "TEST" => AllocatorConfig::Test,
            other => {
                return Err(ConfigError::Invalid {
                    key: "VIZGATE_JOB_ALLOCATOR",
                    reason: format!("unknown allocator {other}"),
                });
            }
        };

        let auth = if env_or("VIZGATE_USE_IDP", "1") != "0" {
            AuthConfig {
                enabled: true,
                user_info_url: require("VIZGATE_IDP_URL")?,
                host: require("VIZGATE_IDP_HOST")?,
            }
        } else {
            AuthConfig {
                enabled: false,
                user_info_url: String::new(),
                host: String::new(),
            }
        };

        Ok(Self {
            log_level: env_or("VIZGATE_LOG_LEVEL", "info"),
            master_port: parsed("VIZGATE_MASTER_PORT", 4444u16)?,
            slave_port: parsed("VIZGATE_SLAVE_PORT", 8888u16)?,
            tls: TlsConfig {
                cert: PathBuf::from(env_or("VIZGATE_SSL_CRT", "sslcert.crt")),
                key: PathBuf::from(env_or("VIZGATE_SSL_KEY", "sslcert.key")),
            },
            registry,
            recreate_registry: env_or("VIZGATE_REGISTRY_RECREATE", "0") == "1",
            allocator,
            auth,
            job_duration: chrono::Duration::seconds(parsed("VIZGATE_JOB_DURATION", 14400i64)?),
            cleanup_period: Duration::from_secs(parsed("VIZGATE_CLEANUP_PERIOD", 10u64)?),
            proxy_base_url: env_or("VIZGATE_PROXY_URL", "ws://localhost:8888")
                .trim_end_matches('/')
                .to_string(),
            renderer_port: parsed("VIZGATE_RENDERER_PORT", 5000u16)?,
            backend_port: parsed("VIZGATE_BACKEND_PORT", 8000u16)?,
        })
    }

    /// Shared outbound HTTP client, used by the authenticator, the allocators,
    /// and the readiness probe.
    pub fn outbound_client(&self) -> Result<reqwest::Client, ConfigError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30));

        if let AllocatorConfig::Unicore(ref unicore) = self.allocator {
            if unicore.ca_file.exists() {
                let pem = std::fs::read(&unicore.ca_file).map_err(|e| ConfigError::Invalid {
                    key: "VIZGATE_UNICORE_CA_FILE",
                    reason: e.to_string(),
                })?;
                let cert =
                    reqwest::Certificate::from_pem(&pem).map_err(|e| ConfigError::Invalid {
                        key: "VIZGATE_UNICORE_CA_FILE",
                        reason: e.to_string(),
                    })?;
                tracing::info!("using extra root CA from {}", unicore.ca_file.display());
                builder = builder.add_root_certificate(cert);
            }
        }

        builder.build().map_err(|e| ConfigError::Client(e.to_string()))
    }
}

/// Bind options shared by both binaries.
#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to bind to.
    #[arg(long, default_value = "0.0.0.0", env = "VIZGATE_BIND_ADDRESS")]
    pub address: String,

    /// Port to bind to; defaults to the service's configured port.
    #[arg(long)]
    pub port: Option<u16>,
}

impl ServeArgs {
    pub fn bind_addr(&self, default_port: u16) -> Result<SocketAddr, ConfigError> {
        let ip = self.address.parse().map_err(|_| ConfigError::Invalid {
            key: "--address",
            reason: format!("not an IP address: {}", self.address),
        })?;
        Ok(SocketAddr::new(ip, self.port.unwrap_or(default_port)))
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_var(key).unwrap_or_else(|| default.to_string())
}

fn require(key: &'static str) -> Result<String, ConfigError> {
    env_var(key).ok_or(ConfigError::Missing(key))
}

fn parsed<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_var(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
            key,
            reason: format!("{e}"),
        }),
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_trims_and_drops_empties() {
        assert_eq!(
            parse_list("subnet-a, subnet-b,,subnet-c "),
            vec!["subnet-a", "subnet-b", "subnet-c"]
        );
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn bind_addr_combines_address_and_port() {
        let args = ServeArgs {
            address: "127.0.0.1".to_string(),
            port: None,
        };
        assert_eq!(args.bind_addr(4444).unwrap().to_string(), "127.0.0.1:4444");

        let args = ServeArgs {
            address: "0.0.0.0".to_string(),
            port: Some(9000),
        };
        assert_eq!(args.bind_addr(4444).unwrap().to_string(), "0.0.0.0:9000");
    }

    #[test]
    fn bind_addr_rejects_hostnames() {
        let args = ServeArgs {
            address: "not-an-ip".to_string(),
            port: None,
        };
        assert!(args.bind_addr(4444).is_err());
    }
}
