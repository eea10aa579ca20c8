//! Engine configuration from environment variables.

use std::env;

use uuid::Uuid;

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    /// This process's identity: stamped on dispatched rows as
    /// `runner_instance`, used as the transport client id, and as the
    /// request-id prefix.
    pub instance: String,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let database_url = env::var("GEARBOX_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .unwrap_or_else(|_| "postgres://localhost/gearbox".to_string());
        let instance = env::var("GEARBOX_INSTANCE").unwrap_or_else(|_| {
            let suffix = Uuid::new_v4().simple().to_string();
            format!("gearbox-{}", &suffix[..8])
        });
        Self {
            database_url,
            instance,
        }
    }
}
