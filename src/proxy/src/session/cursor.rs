//! Cursors opened by server-internal query translators. Each cursor carries a
//! last-access stamp and is closed automatically once idle longer than the
//! session-wide timeout; the sweep runs as a worker delayed call.

use coarsetime::Instant;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Cursor {
    pub id: u64,
    last_access: Instant,
}

impl Cursor {
    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.last_access.elapsed().as_millis())
    }
}

#[derive(Debug)]
pub struct CursorRegistry {
    cursors: hashbrown::HashMap<u64, Cursor>,
    next_id: u64,
    idle_timeout: Duration,
}

impl CursorRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            cursors: hashbrown::HashMap::new(),
            next_id: 0,
            idle_timeout,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn open(&mut self) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.cursors.insert(
            id,
            Cursor {
                id,
                last_access: Instant::now(),
            },
        );
        id
    }

    pub fn touch(&mut self, id: u64) -> bool {
        match self.cursors.get_mut(&id) {
            Some(cursor) => {
                cursor.touch();
                true
            }
            None => false,
        }
    }

    pub fn close(&mut self, id: u64) -> bool {
        self.cursors.remove(&id).is_some()
    }

    /// Closes every cursor idle longer than the timeout; returns the closed ids.
    pub fn sweep(&mut self) -> Vec<u64> {
        let timeout = self.idle_timeout;
        let expired: Vec<u64> = self
            .cursors
            .values()
            .filter(|c| c.idle() >= timeout)
            .map(|c| c.id)
            .collect();
        for id in &expired {
            self.cursors.remove(id);
        }
        expired
    }

    pub fn close_all(&mut self) {
        self.cursors.clear();
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_sweep_closes_only_expired() {
        let mut registry = CursorRegistry::new(Duration::from_millis(0));
        let a = registry.open();
        let b = registry.open();
        registry.close(b);
        // zero timeout: everything still open counts as expired
        let swept = registry.sweep();
        assert_eq!(swept, vec![a]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_touch_keeps_cursor_alive() {
        let mut registry = CursorRegistry::new(Duration::from_secs(3600));
        let id = registry.open();
        assert!(registry.touch(id));
        assert!(registry.sweep().is_empty());
        assert_eq!(registry.len(), 1);
        assert!(!registry.touch(999));
    }
}
