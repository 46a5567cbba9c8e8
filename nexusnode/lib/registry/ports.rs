use std::{collections::BTreeSet, sync::Mutex};

use crate::config::PortRange;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The pool of host ports that can be bound to instances.
pub struct PortPool {
    range: PortRange,
    allocated: Mutex<BTreeSet<u16>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PortPool {
    /// Creates a pool over `range` with `allocated` already taken.
    pub fn new(range: PortRange, allocated: impl IntoIterator<Item = u16>) -> Self {
        Self {
            range,
            allocated: Mutex::new(allocated.into_iter().collect()),
        }
    }

    /// Takes the lowest free port, or `None` if the pool is exhausted.
    pub fn reserve(&self) -> Option<u16> {
        let mut allocated = match self.allocated.lock() {
            Ok(allocated) => allocated,
            Err(poisoned) => poisoned.into_inner(),
        };

        let port = self.range.iter().find(|p| !allocated.contains(p))?;
        allocated.insert(port);
        Some(port)
    }

    /// Returns a port to the pool.
    pub fn release(&self, port: u16) {
        if let Ok(mut allocated) = self.allocated.lock() {
            allocated.remove(&port);
        }
    }

    /// Number of ports still free.
    pub fn available(&self) -> usize {
        let allocated = match self.allocated.lock() {
            Ok(allocated) => allocated,
            Err(poisoned) => poisoned.into_inner(),
        };

        self.range.iter().filter(|p| !allocated.contains(p)).count()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_lowest_free_port_and_exhaust() {
        let pool = PortPool::new(PortRange::new(8000, 8002), [8000]);

        assert_eq!(pool.reserve(), Some(8001));
        assert_eq!(pool.reserve(), Some(8002));
        assert_eq!(pool.reserve(), None);
        assert_eq!(pool.available(), 0);

        pool.release(8001);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.reserve(), Some(8001));
    }
}
