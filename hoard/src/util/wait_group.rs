use std::sync::{Condvar, Mutex};

/// Counts in-flight operations and lets shutdown wait for them to drain.
///
/// [WaitGroup::enter] returns a guard; the count drops when the guard does,
/// so early returns and panics release their slot.
#[derive(Default)]
pub struct WaitGroup {
    count: Mutex<usize>,
    drained: Condvar,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> WaitGroupGuard<'_> {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        WaitGroupGuard { group: self }
    }

    /// Blocks until every guard handed out so far has been dropped.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.drained.wait(count).unwrap();
        }
    }
}

pub struct WaitGroupGuard<'a> {
    group: &'a WaitGroup,
}

impl Drop for WaitGroupGuard<'_> {
    fn drop(&mut self) {
        let mut count = self.group.count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.group.drained.notify_all();
        }
    }
}
