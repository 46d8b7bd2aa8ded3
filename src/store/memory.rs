use std::sync::Mutex;

use super::{StoreError, TaskStore};
use crate::error::Result;
use crate::model::Ledger;

/// In-process store with the same commit-or-nothing semantics as
/// [`super::FileStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    ledger: Mutex<Ledger>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryStore {
    fn transact(&self, apply: &mut dyn FnMut(&mut Ledger) -> Result<()>) -> Result<()> {
        let mut guard = self
            .ledger
            .lock()
            .map_err(|_| StoreError::Lock("memory store mutex poisoned".into()))?;
        let mut working = guard.clone();
        apply(&mut working)?;
        *guard = working;
        Ok(())
    }

    fn snapshot(&self) -> Result<Ledger> {
        let guard = self
            .ledger
            .lock()
            .map_err(|_| StoreError::Lock("memory store mutex poisoned".into()))?;
        Ok(guard.clone())
    }
}
