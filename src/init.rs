// src/init.rs - One-time lazy initialization of the backend
use crate::backend::Backend;
use crate::error::{AccelError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Instant;

/// Process-wide initialization state of one backend.
///
/// The flag only moves from false to true. Initialization runs under a mutex
/// with the state checked before and after acquiring it, so concurrent first
/// callers produce exactly one native `init`. A failed `init` is remembered
/// and returned to every later caller.
#[derive(Debug, Default)]
pub struct InitGate {
    initialized: AtomicBool,
    failure: OnceLock<AccelError>,
    lock: Mutex<()>,
}

impl InitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialized and not inherited across a fork.
    pub fn is_initialized(&self, backend: &dyn Backend) -> bool {
        self.initialized.load(Ordering::Acquire) && !backend.is_in_bad_fork()
    }

    pub fn lazy_init(&self, backend: &dyn Backend) -> Result<()> {
        if self.is_initialized(backend) {
            return Ok(());
        }

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_initialized(backend) {
            return Ok(());
        }

        let kind = backend.device_type();
        if backend.is_in_bad_fork() {
            log::error!("{} runtime was initialized before this process forked", kind);
            return Err(AccelError::BadFork { kind });
        }
        if !backend.is_compiled() {
            return Err(AccelError::NotCompiled { kind });
        }

        if let Some(err) = self.failure.get() {
            return Err(err.clone());
        }

        let start = Instant::now();
        if let Err(err) = backend.init() {
            log::error!("{} runtime initialization failed: {}", kind, err);
            let _ = self.failure.set(err.clone());
            return Err(err);
        }
        self.initialized.store(true, Ordering::Release);
        log::info!(
            "{} runtime initialized in {}ms",
            kind,
            start.elapsed().as_millis()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SimBackend, UnavailableBackend};
    use crate::device::DeviceType;

    #[test]
    fn test_init_once() {
        let backend = SimBackend::with_devices(1);
        let gate = InitGate::new();
        assert!(!gate.is_initialized(&backend));

        gate.lazy_init(&backend).unwrap();
        gate.lazy_init(&backend).unwrap();
        assert!(gate.is_initialized(&backend));
        assert_eq!(backend.init_calls(), 1);
    }

    #[test]
    fn test_not_compiled() {
        let backend = UnavailableBackend::new(DeviceType::Cuda);
        let gate = InitGate::new();
        assert_eq!(
            gate.lazy_init(&backend),
            Err(AccelError::NotCompiled { kind: DeviceType::Cuda })
        );
        assert!(!gate.is_initialized(&backend));
    }

    #[test]
    fn test_failed_init_is_terminal() {
        let backend = SimBackend::with_devices(1);
        backend.fail_next_init("driver refused");
        let gate = InitGate::new();

        let err = gate.lazy_init(&backend).unwrap_err();
        assert!(matches!(err, AccelError::Backend { operation: "init", .. }));
        assert!(!gate.is_initialized(&backend));

        assert_eq!(gate.lazy_init(&backend), Err(err));
        assert_eq!(backend.init_calls(), 1);
    }

    #[test]
    fn test_bad_fork_is_fatal() {
        let backend = SimBackend::with_devices(1);
        let gate = InitGate::new();
        gate.lazy_init(&backend).unwrap();

        backend.simulate_fork();
        assert!(!gate.is_initialized(&backend));
        let err = gate.lazy_init(&backend).unwrap_err();
        assert_eq!(err, AccelError::BadFork { kind: DeviceType::Sim });
        assert!(err.is_fatal());
        assert_eq!(backend.init_calls(), 1);
    }
}
