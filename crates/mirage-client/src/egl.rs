//! Scoped acquisition of the EGL context shared between the render thread
//! and the decoder.
//!
//! All XR swapchain work and all GL operations on decoder textures happen
//! inside a scope obtained from [`EglLock::acquire_pbuffer`]; the scope
//! makes the shared context current on a pbuffer surface and releases it on
//! drop. Nesting is not permitted: a nested acquire on the same thread
//! deadlocks by construction.

use std::sync::{Mutex, MutexGuard};

use tracing::warn;

#[derive(Debug, thiserror::Error)]
#[error("EGL error: {0}")]
pub struct EglError(pub String);

/// The platform's EGL make-current operations. The context and surfaces
/// themselves are created by the platform layer.
pub trait EglContext: Send + Sync {
    fn make_current_pbuffer(&self) -> Result<(), EglError>;
    fn clear_current(&self) -> Result<(), EglError>;
}

/// A no-op context for hosts without a real EGL stack (tests, headless).
pub struct NullEglContext;

impl EglContext for NullEglContext {
    fn make_current_pbuffer(&self) -> Result<(), EglError> {
        Ok(())
    }

    fn clear_current(&self) -> Result<(), EglError> {
        Ok(())
    }
}

pub struct EglLock {
    context: Box<dyn EglContext>,
    gate: Mutex<()>,
}

impl EglLock {
    pub fn new(context: Box<dyn EglContext>) -> Self {
        Self {
            context,
            gate: Mutex::new(()),
        }
    }

    /// Make the shared context current on the calling thread, holding the
    /// internal mutex until the returned scope drops.
    pub fn acquire_pbuffer(&self) -> Result<EglScope<'_>, EglError> {
        let guard = self
            .gate
            .lock()
            .map_err(|_| EglError("EGL gate poisoned".into()))?;
        self.context.make_current_pbuffer()?;
        Ok(EglScope {
            lock: self,
            _guard: guard,
        })
    }
}

pub struct EglScope<'a> {
    lock: &'a EglLock,
    _guard: MutexGuard<'a, ()>,
}

impl Drop for EglScope<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.context.clear_current() {
            warn!(%err, "failed to release EGL context");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    struct CountingContext {
        depth: Arc<AtomicI32>,
    }

    impl EglContext for CountingContext {
        fn make_current_pbuffer(&self) -> Result<(), EglError> {
            self.depth.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn clear_current(&self) -> Result<(), EglError> {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn scope_balances_current_and_release() {
        let depth = Arc::new(AtomicI32::new(0));
        let lock = EglLock::new(Box::new(CountingContext {
            depth: Arc::clone(&depth),
        }));

        {
            let _scope = lock.acquire_pbuffer().unwrap();
            assert_eq!(depth.load(Ordering::SeqCst), 1);
        }
        assert_eq!(depth.load(Ordering::SeqCst), 0);

        // Sequential re-acquisition works.
        let _again = lock.acquire_pbuffer().unwrap();
        assert_eq!(depth.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn contended_acquire_waits_for_release() {
        let depth = Arc::new(AtomicI32::new(0));
        let lock = Arc::new(EglLock::new(Box::new(CountingContext {
            depth: Arc::clone(&depth),
        })));

        let scope = lock.acquire_pbuffer().unwrap();
        let lock2 = Arc::clone(&lock);
        let waiter = std::thread::spawn(move || {
            let _scope = lock2.acquire_pbuffer().unwrap();
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(scope);
        waiter.join().unwrap();
        assert_eq!(depth.load(Ordering::SeqCst), 0);
    }
}
