//! Eagerly resolved tables of engine-side constants.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use super::{CallEnv, ForeignConstant};
use crate::error::FetchError;
use crate::labels::ForeignConstantKey;

/// Maps every variant of `K` to its resolved engine constant.
///
/// Built once when a cache handle is constructed. A variant the engine does
/// not know fails the build, so lookups afterwards cannot miss.
pub struct ConstantTable<K: ForeignConstantKey> {
    entries: HashMap<K, ForeignConstant>,
}

impl<K: ForeignConstantKey> ConstantTable<K> {
    /// Resolves every variant of `K` through the runtime.
    pub fn resolve(env: &CallEnv<'_>) -> Result<Self, FetchError> {
        let mut entries = HashMap::with_capacity(K::ALL.len());
        for key in K::ALL {
            let constant = env
                .call(|rt| rt.lookup_constant(K::CLASS, key.foreign_name()))
                .map_err(|e| {
                    FetchError::engine_unavailable(format!(
                        "can't resolve {}.{}: {}",
                        K::CLASS,
                        key.foreign_name(),
                        e
                    ))
                })?;
            entries.insert(*key, constant);
        }
        debug!(class = K::CLASS, count = entries.len(), "Resolved constant table");
        Ok(Self { entries })
    }

    /// Returns the constant for `key`.
    pub fn get(&self, key: K) -> ForeignConstant {
        // resolve() inserted every variant listed in K::ALL
        self.entries[&key]
    }

    /// Returns the number of resolved constants.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: ForeignConstantKey> fmt::Debug for ConstantTable<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstantTable")
            .field("class", &K::CLASS)
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::RuntimeBridge;
    use crate::engine::{LocalRuntime, LocalRuntimeConfig};
    use crate::labels::{StrategyType, TimeUnit};
    use std::sync::Arc;

    #[test]
    fn test_resolves_every_variant() {
        let runtime = LocalRuntime::start(LocalRuntimeConfig::default()).unwrap();
        let bridge = RuntimeBridge::new(runtime);
        let env = bridge.env().unwrap();

        let units = ConstantTable::<TimeUnit>::resolve(&env).unwrap();
        assert_eq!(units.len(), TimeUnit::ALL.len());
        assert_ne!(units.get(TimeUnit::Seconds), units.get(TimeUnit::Milliseconds));

        let strategies = ConstantTable::<StrategyType>::resolve(&env).unwrap();
        assert_eq!(strategies.len(), StrategyType::ALL.len());
    }

    #[test]
    fn test_missing_constant_fails_eagerly() {
        let runtime = LocalRuntime::start(LocalRuntimeConfig::default()).unwrap();
        runtime.hide_constant("MICROSECONDS");
        let bridge = RuntimeBridge::new(Arc::clone(&runtime) as _);
        let env = bridge.env().unwrap();

        let err = ConstantTable::<TimeUnit>::resolve(&env).unwrap_err();
        assert!(matches!(err, FetchError::EngineUnavailable(_)));
        assert!(err.to_string().contains("MICROSECONDS"));
    }
}
