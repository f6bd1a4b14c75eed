//! Worker-host configuration: task queue, health port and object-store
//! connection, sourced from environment variables with CLI overrides
//! applied in `main`.

use std::env;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub task_queue: String,
    pub health_port: u16,
    pub store: StoreConfig,
    /// Explicit provider-config path; the conventional lookup applies when
    /// unset
    pub providers_config_path: Option<String>,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            task_queue: env_or("VOXFLOW_TASK_QUEUE", "transcription"),
            health_port: env_or("VOXFLOW_HEALTH_PORT", "8090")
                .parse()
                .unwrap_or(8090),
            store: StoreConfig {
                endpoint: env_or("VOXFLOW_STORE_ENDPOINT", "http://localhost:9000"),
                access_key: env_or("VOXFLOW_STORE_ACCESS_KEY", "minioadmin"),
                secret_key: env_or("VOXFLOW_STORE_SECRET_KEY", "minioadmin"),
                bucket: env_or("VOXFLOW_STORE_BUCKET", "voxflow"),
                region: env_or("VOXFLOW_STORE_REGION", "us-east-1"),
            },
            providers_config_path: env::var("VOXFLOW_PROVIDERS_CONFIG")
                .ok()
                .filter(|value| !value.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test covers defaults and overrides: the process environment is
    // shared across test threads, so the variables are touched only here.
    #[test]
    fn test_defaults_and_env_overrides() {
        env::remove_var("VOXFLOW_TASK_QUEUE");
        env::remove_var("VOXFLOW_HEALTH_PORT");
        env::remove_var("VOXFLOW_STORE_ENDPOINT");
        let config = WorkerConfig::from_env();
        assert_eq!(config.task_queue, "transcription");
        assert_eq!(config.health_port, 8090);
        assert_eq!(config.store.bucket, "voxflow");

        env::set_var("VOXFLOW_TASK_QUEUE", "transcription-test");
        env::set_var("VOXFLOW_STORE_ENDPOINT", "http://minio:9000");
        let config = WorkerConfig::from_env();
        assert_eq!(config.task_queue, "transcription-test");
        assert_eq!(config.store.endpoint, "http://minio:9000");
        env::remove_var("VOXFLOW_TASK_QUEUE");
        env::remove_var("VOXFLOW_STORE_ENDPOINT");
    }
}
