//! Where the proxy list comes from on startup and on every refresh

use super::ProxyError;
use crate::config::ProxyConfig;

/// Provides the current comma-separated proxy list
pub trait ProxyListSource: Send + Sync {
    fn load(&self) -> Result<String, ProxyError>;
}

/// Fixed list from the configuration file
pub struct StaticSource(pub String);

impl ProxyListSource for StaticSource {
    fn load(&self) -> Result<String, ProxyError> {
        Ok(self.0.clone())
    }
}

/// List re-read from an environment variable, with a configured fallback
pub struct EnvSource {
    pub var: String,
    pub fallback: String,
}

impl ProxyListSource for EnvSource {
    fn load(&self) -> Result<String, ProxyError> {
        match std::env::var(&self.var) {
            Ok(value) => Ok(value),
            Err(std::env::VarError::NotPresent) => Ok(self.fallback.clone()),
            Err(e) => Err(ProxyError::Source(format!("{}: {e}", self.var))),
        }
    }
}

/// Source selected by `proxy_list_env`, falling back to the static list
pub fn source_for(config: &ProxyConfig) -> Box<dyn ProxyListSource> {
    match &config.proxy_list_env {
        Some(var) => Box::new(EnvSource {
            var: var.clone(),
            fallback: config.proxy_list.clone(),
        }),
        None => Box::new(StaticSource(config.proxy_list.clone())),
    }
}
