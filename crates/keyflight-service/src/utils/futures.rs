/// Runs a closure when dropped.
///
/// Used to tear down bookkeeping for spawned computations regardless of whether they finish,
/// panic or get cancelled.
pub struct CallOnDrop {
    f: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CallOnDrop {
    pub fn new<F: FnOnce() + Send + 'static>(f: F) -> CallOnDrop {
        CallOnDrop {
            f: Some(Box::new(f)),
        }
    }
}

impl Drop for CallOnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn test_runs_on_drop() {
        let called = Arc::new(AtomicBool::new(false));
        let token = {
            let called = Arc::clone(&called);
            CallOnDrop::new(move || called.store(true, Ordering::SeqCst))
        };
        assert!(!called.load(Ordering::SeqCst));
        drop(token);
        assert!(called.load(Ordering::SeqCst));
    }
}
