//! Application configuration

use std::env;
use std::path::PathBuf;

use crate::runtime::{EscalationDecision, RuntimeConfig};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Root of the module tree
    pub modules_dir: PathBuf,

    /// Port for the gateway (requests dispatched to modules)
    pub gateway_port: u16,

    /// Port for the admin API (health, status, reload)
    pub admin_port: u16,

    /// Hostnames of the main site
    pub domains: Vec<String>,

    /// Path prefix whose errors render as JSON
    pub api_prefix: String,

    /// HTML template for non-API error pages
    pub error_template: Option<PathBuf>,

    /// Development mode (permissive CORS on the API)
    pub dev: bool,

    /// What to do when neither a load nor a rollback left working modules
    pub on_fatal: EscalationDecision,

    /// Largest request body accepted by the gateway
    pub max_body_bytes: usize,

    /// Heartbeat period of the health module
    pub heartbeat_secs: u64,
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            modules_dir: env::var("MODHOST_MODULES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./modules")),

            gateway_port: env::var("MODHOST_GATEWAY_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8080),

            admin_port: env::var("MODHOST_ADMIN_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8081),

            domains: env::var("MODHOST_DOMAINS")
                .ok()
                .map(|s| {
                    s.split(',')
                        .map(|d| d.trim().to_string())
                        .filter(|d| !d.is_empty())
                        .collect::<Vec<_>>()
                })
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| vec!["localhost".to_string()]),

            api_prefix: env::var("MODHOST_API_PREFIX").unwrap_or_else(|_| "/api".to_string()),

            error_template: env::var("MODHOST_ERROR_TEMPLATE").ok().map(PathBuf::from),

            dev: env::var("MODHOST_DEV")
                .ok()
                .and_then(|s| parse_bool(&s))
                .unwrap_or(false),

            on_fatal: env::var("MODHOST_ON_FATAL")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(EscalationDecision::Terminate),

            max_body_bytes: env::var("MODHOST_MAX_BODY_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8 * 1024 * 1024),

            heartbeat_secs: env::var("MODHOST_HEARTBEAT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
        }
    }

    /// The subset handed to modules during setup
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            main_domains: self.domains.clone(),
            api_prefix: self.api_prefix.clone(),
            error_template: self.error_template.clone(),
            dev: self.dev,
            heartbeat_secs: self.heartbeat_secs,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
