use std::collections::HashMap;

/// Storage of objects addressed by integer handles (frame ids, variable references).
///
/// Handles are valid while the debuggee is stopped, the store is reset on every resume.
/// Handle values are never reused, so a stale handle resolves to nothing.
#[derive(Debug)]
pub struct Handles<T> {
    next_ref: i64,
    store: HashMap<i64, T>,
}

impl<T> Default for Handles<T> {
    fn default() -> Self {
        Self {
            next_ref: 0,
            store: HashMap::new(),
        }
    }
}

impl<T> Handles<T> {
    pub fn alloc(&mut self, value: T) -> i64 {
        self.next_ref += 1;
        let key = self.next_ref;
        self.store.insert(key, value);
        key
    }

    pub fn get(&self, handle: i64) -> Option<&T> {
        self.store.get(&handle)
    }

    pub fn reset(&mut self) {
        self.store.clear();
    }
}
