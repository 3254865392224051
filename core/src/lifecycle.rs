//! Scoped resource teardown (spec §9 "Global mutable state" / "goto-based
//! cleanup" redesign notes).
//!
//! The original C implementation holds two process-wide singletons — a
//! `globals_t` naming the current disk and its loopback device, and a mount
//! context unwound at `atexit` — and frees resources via `goto done`. This
//! type replaces both: it is an explicit value threaded through the
//! lifecycle driver whose `Drop` impl releases every resource registered
//! against it, in reverse acquisition order, on every exit path (including
//! panics unwinding through it and early `?` returns).

use std::path::PathBuf;

/// Threaded through `cli::lifecycle` operations. Owns the path to the disk
/// under operation and a LIFO list of teardown actions (loopback detach,
/// mount/unmount, temp directory removal, device-mapper pool/volume
/// teardown) registered as resources are acquired.
pub struct LifecycleContext {
    disk: PathBuf,
    teardown: Vec<Box<dyn FnOnce() + Send>>,
}

impl LifecycleContext {
    pub fn new(disk: impl Into<PathBuf>) -> Self {
        Self {
            disk: disk.into(),
            teardown: Vec::new(),
        }
    }

    pub fn disk(&self) -> &std::path::Path {
        &self.disk
    }

    /// Registers a teardown action to run (in LIFO order relative to other
    /// registrations) when this context is dropped.
    pub fn on_teardown<F>(&mut self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.teardown.push(Box::new(action));
    }
}

impl Drop for LifecycleContext {
    fn drop(&mut self) {
        while let Some(action) = self.teardown.pop() {
            action();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn teardown_runs_in_reverse_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let mut ctx = LifecycleContext::new("/tmp/disk.img");
            for i in 0..3 {
                let order = order.clone();
                ctx.on_teardown(move || order.lock().unwrap().push(i));
            }
        }
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn teardown_runs_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let mut ctx = LifecycleContext::new("/tmp/disk.img");
            let count = count.clone();
            ctx.on_teardown(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
