use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Harness-injected configuration visible to every route script.
pub type TestConfig = Map<String, Value>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CallRecord {
    pub route: String,
    pub body: Option<String>,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("unable to parse config: {0}")]
    InvalidConfig(#[from] serde_json::Error),
}

#[derive(Default)]
struct TestState {
    config: Option<Arc<TestConfig>>,
    calls: Vec<CallRecord>,
}

/// Test config slot and call log guarded by a single lock, so a config swap can never
/// interleave with an append or a log read.
#[derive(Default)]
pub struct TestStateStore {
    inner: Mutex<TestState>,
}

impl TestStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Replaces the config wholesale. A zero-length payload clears the override; any
    /// other payload that is not a JSON object leaves the current config untouched.
    pub fn set_config(&self, payload: &[u8]) -> Result<Option<Arc<TestConfig>>, StateError> {
        let next = if payload.is_empty() {
            None
        } else {
            Some(Arc::new(serde_json::from_slice::<TestConfig>(payload)?))
        };

        let mut state = self.lock();
        state.config = next.clone();
        Ok(next)
    }

    #[must_use]
    pub fn config_snapshot(&self) -> Option<Arc<TestConfig>> {
        self.lock().config.clone()
    }

    pub fn reset_calls(&self) {
        self.lock().calls.clear();
    }

    #[must_use]
    pub fn calls(&self) -> Vec<CallRecord> {
        self.lock().calls.clone()
    }

    pub(crate) fn record_call(&self, route: String, body: Option<String>) {
        self.lock().calls.push(CallRecord { route, body });
    }

    fn lock(&self) -> MutexGuard<'_, TestState> {
        // Every critical section leaves the state consistent, so a poisoned lock is safe
        // to keep using.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
