use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

/// Live realtime sessions per user.
#[derive(Default)]
pub struct Sessions {
    counts: Mutex<HashMap<Uuid, usize>>,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns true if it is the user's first.
    pub fn connect(&self, user_id: Uuid) -> bool {
        let mut guard = self.counts.lock();
        let c = guard.entry(user_id).or_insert(0);
        *c += 1;
        *c == 1
    }

    /// Deregister a connection. Returns true if it was the user's last.
    pub fn disconnect(&self, user_id: Uuid) -> bool {
        let mut guard = self.counts.lock();
        match guard.get_mut(&user_id) {
            Some(c) if *c > 1 => {
                *c -= 1;
                false
            }
            Some(_) => {
                guard.remove(&user_id);
                true
            }
            None => false,
        }
    }

    pub fn connected(&self, user_id: &Uuid) -> usize {
        self.counts.lock().get(user_id).copied().unwrap_or(0)
    }
}
