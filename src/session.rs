use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;

use crate::error::{Error, Result};

/// A store of session values keyed by session id.
pub trait Session: Send + Sync {
    /// Returns the value of the session `id`, or `None` if there is none.
    fn get_session(&self, id: &str) -> Result<Option<Value>>;

    /// Stores `value` as the session `id`. A null value deletes the session.
    fn set_session(&self, id: &str, value: Value) -> Result;
}

/// A session store kept in process memory.
#[derive(Debug, Default)]
pub struct MemorySession {
    sessions: RwLock<HashMap<String, Value>>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Session for MemorySession {
    fn get_session(&self, id: &str) -> Result<Option<Value>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| Error::msg("session store lock poisoned"))?;
        Ok(sessions.get(id).cloned())
    }

    fn set_session(&self, id: &str, value: Value) -> Result {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| Error::msg("session store lock poisoned"))?;
        if value.is_null() {
            sessions.remove(id);
        } else {
            sessions.insert(id.to_owned(), value);
        }
        Ok(())
    }
}
