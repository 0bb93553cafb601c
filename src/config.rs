use std::{collections::HashMap, time::Duration};

use config::{Config as ConfigLib, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

pub const DEFAULT_AID: &str = "F0010203040506";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub emulation: EmulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulationConfig {
    /// Application identifier, in hex, the emulated tag answers to.
    /// Parsed when a service is created, not here.
    pub aid: String,
    pub reconcile_interval_secs: u64,
}

impl EmulationConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_sources(None)
    }

    pub fn load_with_sources(
        env_vars: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = ConfigLib::builder()
            .set_default("emulation.aid", DEFAULT_AID)?
            .set_default("emulation.reconcile_interval_secs", 30)?
            .add_source(File::with_name("config/settings").required(false));

        // Explicit overrides keep tests independent of the process environment
        if let Some(vars) = env_vars {
            for (key, value) in vars {
                builder = builder.set_override(&key, value)?;
            }
        } else {
            // e.g. HCE_EMULATION__AID=F0010203040506
            builder = builder.add_source(
                Environment::with_prefix("HCE")
                    .prefix_separator("_")
                    .separator("__"),
            );
        }

        builder.build()?.try_deserialize()
    }
}
