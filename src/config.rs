//! Application configuration
//!
//! Environment variables with defaults, read once at startup.

use crate::launcher::LauncherSettings;
use crate::orchestrator::{Backoff, LaunchDefaults};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Launch configuration
    pub launch: LaunchConfig,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind the server to
    pub port: u16,
    /// Host address to bind to
    pub host: String,
}

/// Launch configuration
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Plan file used when a launch request carries no plan
    pub plan_path: Option<PathBuf>,
    /// Run the configured plan as soon as the server starts
    pub launch_on_start: bool,
    /// Stop spawned runtimes when the server exits
    pub teardown_on_exit: bool,
    /// Default per-attempt readiness timeout (in seconds)
    pub timeout_secs: u64,
    /// Default readiness poll interval (in milliseconds)
    pub poll_interval_ms: u64,
    /// Default retries after the first attempt
    pub max_retries: u32,
    /// Detection probe timeout (in milliseconds)
    pub detect_timeout_ms: u64,
    /// Grace period before force-killing an owned runtime (in seconds)
    pub terminate_grace_secs: u64,
    /// Early-exit window after spawning (in milliseconds)
    pub startup_grace_ms: u64,
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig {
                port: parsed_or("PORT", 7878),
                host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            },
            launch: LaunchConfig {
                plan_path: env::var_os("LAUNCH_PLAN")
                    .filter(|v| !v.is_empty())
                    .map(PathBuf::from),
                launch_on_start: parsed_or("LAUNCH_ON_START", false),
                teardown_on_exit: parsed_or("LAUNCH_TEARDOWN_ON_EXIT", true),
                timeout_secs: parsed_or("LAUNCH_TIMEOUT_SECS", 60),
                poll_interval_ms: parsed_or("LAUNCH_POLL_INTERVAL_MS", 500),
                max_retries: parsed_or("LAUNCH_MAX_RETRIES", 1),
                detect_timeout_ms: parsed_or("LAUNCH_DETECT_TIMEOUT_MS", 2000),
                terminate_grace_secs: parsed_or("LAUNCH_TERMINATE_GRACE_SECS", 5),
                startup_grace_ms: parsed_or("LAUNCH_STARTUP_GRACE_MS", 250),
            },
        }
    }

    /// Get the server address as a string
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Defaults applied to plan-file stages
    pub fn launch_defaults(&self) -> LaunchDefaults {
        let launch = &self.launch;
        let detect_timeout = Duration::from_millis(launch.detect_timeout_ms);
        LaunchDefaults {
            timeout: Duration::from_secs(launch.timeout_secs),
            poll_interval: Duration::from_millis(launch.poll_interval_ms),
            max_retries: launch.max_retries,
            backoff: Backoff::default(),
            launcher: LauncherSettings {
                detect_timeout,
                probe_timeout: detect_timeout,
                terminate_grace: Duration::from_secs(launch.terminate_grace_secs),
                startup_grace: Duration::from_millis(launch.startup_grace_ms),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 11] = [
        "HOST",
        "PORT",
        "LAUNCH_PLAN",
        "LAUNCH_ON_START",
        "LAUNCH_TEARDOWN_ON_EXIT",
        "LAUNCH_TIMEOUT_SECS",
        "LAUNCH_POLL_INTERVAL_MS",
        "LAUNCH_MAX_RETRIES",
        "LAUNCH_DETECT_TIMEOUT_MS",
        "LAUNCH_TERMINATE_GRACE_SECS",
        "LAUNCH_STARTUP_GRACE_MS",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = Config::from_env();
        assert_eq!(config.server_addr(), "127.0.0.1:7878");
        assert!(config.launch.plan_path.is_none());
        assert!(!config.launch.launch_on_start);
        assert!(config.launch.teardown_on_exit);

        let defaults = config.launch_defaults();
        assert_eq!(defaults.timeout, Duration::from_secs(60));
        assert_eq!(defaults.poll_interval, Duration::from_millis(500));
        assert_eq!(defaults.max_retries, 1);
        assert_eq!(defaults.launcher.detect_timeout, Duration::from_secs(2));
        assert_eq!(defaults.launcher.terminate_grace, Duration::from_secs(5));
        assert_eq!(defaults.launcher.startup_grace, Duration::from_millis(250));
    }

    #[test]
    #[serial]
    fn test_overrides_and_bad_values() {
        clear_env();
        env::set_var("PORT", "9000");
        env::set_var("LAUNCH_PLAN", "/etc/router/plan.json");
        env::set_var("LAUNCH_ON_START", "true");
        env::set_var("LAUNCH_TIMEOUT_SECS", "not-a-number");
        env::set_var("LAUNCH_MAX_RETRIES", "3");

        let config = Config::from_env();
        clear_env();

        assert_eq!(config.server.port, 9000);
        assert_eq!(
            config.launch.plan_path,
            Some(PathBuf::from("/etc/router/plan.json"))
        );
        assert!(config.launch.launch_on_start);
        assert_eq!(config.launch.timeout_secs, 60);
        assert_eq!(config.launch.max_retries, 3);
    }
}
