//! Backend selection
//!
//! The backend is chosen once per process. [`BackendHandle`] is the
//! single-assignment slot every consumer awaits; [`BackendSelector`] decides
//! which engine goes into it.

use super::kernel::{has_kernel_support, KernelBackend};
use super::root_shell::RootShell;
use super::userspace::UserspaceBackend;
use super::{Backend, EngineSettings};
use crate::config::knobs::KnobStore;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Single-assignment holder for the process-wide backend
///
/// Consumers waiting in [`BackendHandle::wait`] all observe the same
/// instance once it is resolved; later resolutions are ignored.
pub struct BackendHandle {
    tx: watch::Sender<Option<Arc<dyn Backend>>>,
}

impl Default for BackendHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendHandle {
    pub fn new() -> Self {
        Self {
            tx: watch::channel(None).0,
        }
    }

    /// Publish `backend`; returns false if the handle was already resolved
    pub fn resolve(&self, backend: Arc<dyn Backend>) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(backend);
                true
            } else {
                false
            }
        })
    }

    pub fn get(&self) -> Option<Arc<dyn Backend>> {
        self.tx.borrow().clone()
    }

    /// Wait until a backend has been resolved
    pub async fn wait(&self) -> Arc<dyn Backend> {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(backend) = rx.borrow_and_update().as_ref() {
                return Arc::clone(backend);
            }
            // The sender lives in `self`, so the channel stays open
            let _ = rx.changed().await;
        }
    }
}

/// Chooses between the kernel and the userspace engine
pub struct BackendSelector {
    knobs: Arc<KnobStore>,
    settings: EngineSettings,
    shell: Arc<RootShell>,
}

impl BackendSelector {
    pub fn new(knobs: Arc<KnobStore>, settings: EngineSettings) -> Self {
        Self {
            knobs,
            settings,
            shell: Arc::new(RootShell::new()),
        }
    }

    /// Build the backend this host should use
    ///
    /// The kernel engine is used when the privileged knob is on, the module
    /// is loaded and a root shell can be started. Anything else falls back
    /// to the userspace engine.
    pub async fn determine(&self) -> Arc<dyn Backend> {
        match self.try_kernel().await {
            Some(kernel) => kernel,
            None => {
                info!("Using userspace tunnel engine");
                Arc::new(UserspaceBackend::new(self.settings.clone()))
            }
        }
    }

    /// Determine the backend and publish it into `handle`
    ///
    /// Returns whatever `handle` holds afterwards, which is the earlier
    /// instance if the handle was already resolved.
    pub async fn select_into(&self, handle: &BackendHandle) -> Arc<dyn Backend> {
        if let Some(existing) = handle.get() {
            return existing;
        }
        let backend = self.determine().await;
        if !handle.resolve(Arc::clone(&backend)) {
            warn!("Backend was already selected, discarding {}", backend.kind());
        }
        handle.wait().await
    }

    async fn try_kernel(&self) -> Option<Arc<dyn Backend>> {
        if !self.knobs.get().privileged_engine_enabled {
            return None;
        }
        if !has_kernel_support(&self.settings) {
            warn!(
                "Kernel engine requested but {:?} is missing",
                self.settings.kernel_module_path
            );
            return None;
        }
        if let Err(e) = self.shell.start().await {
            warn!("Kernel engine requested but elevation failed: {}", e);
            return None;
        }

        let kernel = Arc::new(KernelBackend::new(
            Arc::clone(&self.shell),
            self.settings.clone(),
        ));
        kernel.set_multiple_tunnels(self.knobs.get().multiple_tunnels);
        // Detached; it stops once the backend is gone
        drop(self.forward_multiple_tunnels(&kernel));

        match kernel.version().await {
            Ok(version) => info!("Using kernel tunnel engine, module version {}", version),
            Err(e) => info!("Using kernel tunnel engine ({})", e),
        }
        Some(kernel as Arc<dyn Backend>)
    }

    /// Keep the backend in sync with the multiple-tunnels knob
    ///
    /// The task ends on the first knob change after the backend is dropped.
    fn forward_multiple_tunnels(&self, kernel: &Arc<KernelBackend>) -> JoinHandle<()> {
        let mut rx = self.knobs.subscribe();
        let weak = Arc::downgrade(kernel);
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let allowed = rx.borrow_and_update().multiple_tunnels;
                match weak.upgrade() {
                    Some(kernel) => kernel.set_multiple_tunnels(allowed),
                    None => break,
                }
            }
        })
    }
}
