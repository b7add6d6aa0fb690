/// Configuration management for the flowkeeper engine
///
/// Handles server configuration, storage location, inbound email settings and
/// the choice of Job Scheduler backend.

use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Inbound email trigger configuration
    pub email: EmailConfig,
    /// Job Scheduler backend configuration
    pub scheduler: SchedulerConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
    /// Externally reachable base URL of this service.
    /// The Job Scheduler calls back into `{public_url}/api/executions`.
    pub public_url: String,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding `flowkeeper.db` (default: "data")
    pub data_dir: String,
}

/// Inbound email configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Fixed domain for generated trigger addresses (`{id}@{domain}`)
    pub domain: String,
    /// Shared secret for the optional webhook signature header
    pub webhook_secret: Option<String>,
}

/// Job Scheduler backend configuration
///
/// When both `url` and `token` are set the remote HTTP scheduler is used,
/// otherwise jobs are dispatched in-process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    /// Retry count handed to the scheduler for every dispatch
    pub retries: u32,
}

impl Config {
    /// Destination the scheduler invokes to run a flow
    pub fn execution_url(&self) -> String {
        format!("{}/api/executions", self.server.public_url.trim_end_matches('/'))
    }

    /// Destination the scheduler invokes once retries are exhausted
    pub fn failure_callback_url(&self) -> String {
        format!("{}/api/executions/failed", self.server.public_url.trim_end_matches('/'))
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        let port = std::env::var("FLOWKEEPER_PORT")
            .unwrap_or_else(|_| "3004".to_string())
            .parse()
            .unwrap_or(3004);

        Self {
            server: ServerConfig {
                host: std::env::var("FLOWKEEPER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port,
                public_url: std::env::var("FLOWKEEPER_PUBLIC_URL")
                    .unwrap_or_else(|_| format!("http://localhost:{}", port)),
            },
            database: DatabaseConfig {
                data_dir: std::env::var("FLOWKEEPER_DATA_DIR")
                    .unwrap_or_else(|_| "data".to_string()),
            },
            email: EmailConfig {
                domain: std::env::var("FLOWKEEPER_EMAIL_DOMAIN")
                    .unwrap_or_else(|_| "flows.flowkeeper.dev".to_string()),
                webhook_secret: std::env::var("FLOWKEEPER_WEBHOOK_SECRET")
                    .ok()
                    .filter(|s| !s.is_empty()),
            },
            scheduler: SchedulerConfig {
                url: std::env::var("FLOWKEEPER_SCHEDULER_URL").ok().filter(|s| !s.is_empty()),
                token: std::env::var("FLOWKEEPER_SCHEDULER_TOKEN").ok().filter(|s| !s.is_empty()),
                retries: 1,
            },
        }
    }
}
