//! Execution engines and their backend pools.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::pool::BackendPool;

/// Kind of compute a subtask asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Engine {
    Local,
    Cloud,
    ToolEnabled,
}

impl Engine {
    pub const ALL: [Engine; 3] = [Engine::Local, Engine::Cloud, Engine::ToolEnabled];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Cloud => "cloud",
            Self::ToolEnabled => "tool-enabled",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = EngineParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "cloud" => Ok(Self::Cloud),
            "tool-enabled" | "tool_enabled" => Ok(Self::ToolEnabled),
            other => Err(EngineParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Engine`] string.
#[derive(Debug, Clone)]
pub struct EngineParseError(pub String);

impl fmt::Display for EngineParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid engine: {:?} (expected local, cloud, or tool-enabled)",
            self.0
        )
    }
}

impl std::error::Error for EngineParseError {}

/// Routing table from engine to backend pool.
///
/// Engines without a route, and engine strings that do not parse, use the
/// default pool.
#[derive(Debug, Clone)]
pub struct EngineRoutes {
    routes: HashMap<Engine, Arc<BackendPool>>,
    default: Arc<BackendPool>,
}

impl EngineRoutes {
    pub fn new(default: Arc<BackendPool>) -> Self {
        Self {
            routes: HashMap::new(),
            default,
        }
    }

    pub fn with_route(mut self, engine: Engine, pool: Arc<BackendPool>) -> Self {
        self.routes.insert(engine, pool);
        self
    }

    pub fn route(&self, engine: Engine) -> &Arc<BackendPool> {
        self.routes.get(&engine).unwrap_or(&self.default)
    }

    /// Pool for the engine named in a plan.
    pub fn resolve(&self, engine: &str) -> &Arc<BackendPool> {
        match engine.parse::<Engine>() {
            Ok(engine) => self.route(engine),
            Err(e) => {
                tracing::warn!(error = %e, "unknown engine, using default pool");
                &self.default
            }
        }
    }

    pub fn default_pool(&self) -> &Arc<BackendPool> {
        &self.default
    }

    /// Every distinct pool, the default first.
    pub fn pools(&self) -> Vec<Arc<BackendPool>> {
        let mut pools = vec![self.default.clone()];
        for engine in Engine::ALL {
            if let Some(pool) = self.routes.get(&engine) {
                if !pools.iter().any(|p| Arc::ptr_eq(p, pool)) {
                    pools.push(pool.clone());
                }
            }
        }
        pools
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_strings_roundtrip() {
        for engine in Engine::ALL {
            assert_eq!(engine.to_string().parse::<Engine>().unwrap(), engine);
        }
        assert_eq!("tool_enabled".parse::<Engine>().unwrap(), Engine::ToolEnabled);
        assert!("minimax".parse::<Engine>().is_err());
    }

    #[test]
    fn engine_serde_uses_kebab_case() {
        let json = serde_json::to_string(&Engine::ToolEnabled).unwrap();
        assert_eq!(json, "\"tool-enabled\"");
    }

    #[test]
    fn resolve_falls_back_to_default_pool() {
        let default = Arc::new(BackendPool::new(vec![]));
        let cloud = Arc::new(BackendPool::new(vec![]));
        let routes = EngineRoutes::new(default.clone()).with_route(Engine::Cloud, cloud.clone());

        assert!(Arc::ptr_eq(routes.resolve("cloud"), &cloud));
        assert!(Arc::ptr_eq(routes.resolve("local"), &default));
        assert!(Arc::ptr_eq(routes.resolve("quantum"), &default));
        assert_eq!(routes.pools().len(), 2);
    }
}
