//! Mock resettable resource for testing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::recovery::ResettableResource;

/// Mock implementation of the ResettableResource trait.
///
/// Counts resets and can be told to fail them.
#[derive(Debug)]
pub struct MockResource {
    name: String,
    resets: AtomicUsize,
    fail: AtomicBool,
}

impl MockResource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resets: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    /// Number of reset attempts, failed ones included.
    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    /// Make resets fail (or succeed again).
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl ResettableResource for MockResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&self) -> Result<(), String> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            Err(format!("{} refused to reset", self.name))
        } else {
            Ok(())
        }
    }
}
