use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::BackendSettings;
use crate::detect::backend::DetectorBackend;
use crate::detect::backends;
use crate::error::DetectError;

/// Backend shared by every pipeline clone once loaded.
pub type SharedBackend = Arc<Mutex<Box<dyn DetectorBackend>>>;

type Loader = Box<dyn FnOnce() -> Result<Box<dyn DetectorBackend>, DetectError> + Send>;

enum BackendState {
    Uninitialized(Loader),
    Ready(SharedBackend),
    Failed(String),
}

/// Observable lifecycle of a [`LazyBackend`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendStatus {
    Uninitialized,
    Ready,
    Failed(String),
}

/// Load-once detection backend.
///
/// The first `get` runs the loader while holding the state lock, so
/// concurrent first callers block and then observe the same outcome. A load
/// failure is terminal: every later `get` returns the same
/// `DetectError::Initialization` without calling the loader again.
pub struct LazyBackend {
    state: Mutex<BackendState>,
}

impl LazyBackend {
    pub fn new<F>(loader: F) -> Self
    where
        F: FnOnce() -> Result<Box<dyn DetectorBackend>, DetectError> + Send + 'static,
    {
        Self {
            state: Mutex::new(BackendState::Uninitialized(Box::new(loader))),
        }
    }

    /// Lazy backend resolved from configuration on first use.
    pub fn from_settings(settings: BackendSettings) -> Self {
        Self::new(move || backends::load_backend(&settings))
    }

    /// Wrap an already constructed backend. Still loads (and warms up) lazily.
    pub fn with_backend<B: DetectorBackend + 'static>(backend: B) -> Self {
        Self::new(move || Ok(Box::new(backend) as Box<dyn DetectorBackend>))
    }

    pub fn get(&self) -> Result<SharedBackend, DetectError> {
        let mut state = self.lock_state();
        match &*state {
            BackendState::Ready(backend) => return Ok(backend.clone()),
            BackendState::Failed(reason) => return Err(DetectError::Initialization(reason.clone())),
            BackendState::Uninitialized(_) => {}
        }

        let placeholder = BackendState::Failed("backend load interrupted".to_string());
        let BackendState::Uninitialized(loader) = std::mem::replace(&mut *state, placeholder)
        else {
            unreachable!("state checked above");
        };

        match load_and_warm(loader) {
            Ok(backend) => {
                log::info!("detection backend '{}' ready", backend.name());
                let shared: SharedBackend = Arc::new(Mutex::new(backend));
                *state = BackendState::Ready(shared.clone());
                Ok(shared)
            }
            Err(err) => {
                let reason = match &err {
                    DetectError::Initialization(reason) => reason.clone(),
                    other => other.to_string(),
                };
                log::error!("detection backend failed to load: {}", reason);
                *state = BackendState::Failed(reason.clone());
                Err(DetectError::Initialization(reason))
            }
        }
    }

    pub fn status(&self) -> BackendStatus {
        match &*self.lock_state() {
            BackendState::Uninitialized(_) => BackendStatus::Uninitialized,
            BackendState::Ready(_) => BackendStatus::Ready,
            BackendState::Failed(reason) => BackendStatus::Failed(reason.clone()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BackendState> {
        // A panic inside a loader leaves the placeholder Failed state behind,
        // which is the outcome we want to report.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn load_and_warm(loader: Loader) -> Result<Box<dyn DetectorBackend>, DetectError> {
    let mut backend = loader()?;
    backend.warm_up().map_err(|e| match e {
        DetectError::Initialization(reason) => DetectError::Initialization(reason),
        other => DetectError::Initialization(format!("warm-up failed: {other}")),
    })?;
    Ok(backend)
}
