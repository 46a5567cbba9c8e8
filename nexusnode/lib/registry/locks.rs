use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::{NexusError, NexusResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Serializes lifecycle operations per instance.
///
/// Operations on different instances never contend with each other.
#[derive(Default)]
pub struct OperationLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Proof that the holder is the only operation in flight for an instance.
pub type OperationGuard = OwnedMutexGuard<()>;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OperationLocks {
    /// Takes the instance's lock, failing with [`NexusError::ConflictingOperation`] if another
    /// operation holds it.
    pub fn try_acquire(&self, instance_id: &str) -> NexusResult<OperationGuard> {
        self.lock_for(instance_id)
            .try_lock_owned()
            .map_err(|_| NexusError::ConflictingOperation(instance_id.to_string()))
    }

    /// Takes the instance's lock, waiting for any operation in flight.
    pub async fn acquire(&self, instance_id: &str) -> OperationGuard {
        self.lock_for(instance_id).lock_owned().await
    }

    /// Drops the lock entry of a deleted instance.
    pub fn forget(&self, instance_id: &str) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.remove(instance_id);
        }
    }

    fn lock_for(&self, instance_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };

        Arc::clone(locks.entry(instance_id.to_string()).or_default())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
