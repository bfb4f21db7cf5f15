//! Manage storage shutdown
//!
//! This crate provides the types used to stop the tick store, either gracefully or in an
//! emergency.
//!
//! # Coordinate shutdown with the [`ShutdownManager`] type
//!
//! The [`ShutdownManager`] is used to coordinate shutdown of the process in an ordered fashion.
//! When a shutdown is signaled externally, or internally by some error state, the persistent data
//! store may still hold dirty files that need to reach the file store before the process exits.
//!
//! Components can [`register`][ShutdownManager::register] to receive a [`ShutdownToken`], which can
//! be used to [`wait_for_shutdown`][ShutdownToken::wait_for_shutdown] to trigger component-specific
//! cleanup logic before signaling back via [`complete`][ShutdownToken::complete] to indicate that
//! shutdown can proceed.
//!
//! # Emergency shutdown
//!
//! When persistence can no longer be relied upon, the store calls an
//! [`EmergencyShutdownControl`]. A [`ShutdownToken`] is one such control: triggering it starts the
//! ordered shutdown above. Without a registered control the [`ProcessTerminator`] is used, which
//! terminates the process from a separate thread.
use std::{
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info};

/// Exit status used when the process is terminated by [`ProcessTerminator`]
pub const EMERGENCY_EXIT_CODE: i32 = 3;

/// Receives the request to stop the process once persistence has failed beyond recovery
///
/// Triggering is fire-and-forget: implementations must not block the caller, which is usually a
/// writer thread or a producer holding no locks.
pub trait EmergencyShutdownControl: Debug + Send + Sync + 'static {
    fn trigger_emergency_shutdown(&self);
}

/// Terminates the whole process asynchronously
///
/// Only the first trigger has an effect; the exit happens on a dedicated thread so that the
/// caller can unwind normally.
#[derive(Debug, Default)]
pub struct ProcessTerminator {
    triggered: AtomicBool,
}

impl ProcessTerminator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether termination has been requested through this instance
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

impl EmergencyShutdownControl for ProcessTerminator {
    fn trigger_emergency_shutdown(&self) {
        if self.triggered.swap(true, Ordering::SeqCst) {
            return;
        }
        let spawned = std::thread::Builder::new()
            .name("emergency-shutdown".to_string())
            .spawn(|| {
                error!(
                    exit_code = EMERGENCY_EXIT_CODE,
                    "emergency shutdown requested, terminating process"
                );
                std::process::exit(EMERGENCY_EXIT_CODE);
            });
        if let Err(e) = spawned {
            error!(%e, "unable to spawn emergency shutdown thread, terminating in place");
            std::process::exit(EMERGENCY_EXIT_CODE);
        }
    }
}

/// Manage application shutdown
#[derive(Debug)]
pub struct ShutdownManager {
    frontend_shutdown: CancellationToken,
    backend_shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ShutdownManager {
    /// Create a [`ShutdownManager`]
    ///
    /// Accepts a [`CancellationToken`] which the `ShutdownManager` will signal cancellation to
    /// after the backend has cleanly shutdown.
    pub fn new(frontend_shutdown: CancellationToken) -> Self {
        Self {
            frontend_shutdown,
            backend_shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Create a [`ShutdownManager`] for testing purposes
    pub fn new_testing() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Register a task that needs to perform work before the process may exit
    ///
    /// Provides a [`ShutdownToken`] which the caller is responsible for handling. The caller must
    /// invoke [`complete`][ShutdownToken::complete] in order for process shutdown to succeed.
    pub fn register(&self) -> ShutdownToken {
        let (tx, rx) = oneshot::channel();
        self.tasks.spawn(rx);
        ShutdownToken::new(self.backend_shutdown.clone(), tx)
    }

    /// Waits for registered tasks to complete before signaling shutdown to frontend
    pub async fn join(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.frontend_shutdown.cancel();
    }

    /// Invoke application shutdown
    ///
    /// This will signal backend shutdown and wake the
    /// [`wait_for_shutdown`][ShutdownToken::wait_for_shutdown] future so that registered tasks can
    /// clean up before indicating completion.
    pub fn shutdown(&self) {
        info!("backend shutdown requested");
        self.backend_shutdown.cancel();
    }
}

/// A token that a component can obtain via [`register`][ShutdownManager::register]
///
/// This implements [`Clone`] so that a component that obtains it can hand copies to the
/// sub-components that may be responsible for triggering a shutdown internally.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    token: CancellationToken,
    complete_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl ShutdownToken {
    fn new(token: CancellationToken, complete_tx: oneshot::Sender<()>) -> Self {
        Self {
            token,
            complete_tx: Arc::new(Mutex::new(Some(complete_tx))),
        }
    }

    /// Trigger application shutdown due to some unrecoverable state
    pub fn trigger_shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been signaled, either by the manager or through a token
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Future that completes when [`ShutdownManager`] that issued this token is shutdown
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Signal back to the [`ShutdownManager`] that the component that owns this token is finished
    /// cleaning up and it is safe for the process to exit
    pub fn complete(&self) {
        if let Some(s) = self.complete_tx.lock().take() {
            let _ = s.send(());
        }
    }
}

impl EmergencyShutdownControl for ShutdownToken {
    fn trigger_emergency_shutdown(&self) {
        error!("emergency shutdown triggered");
        self.trigger_shutdown();
    }
}
