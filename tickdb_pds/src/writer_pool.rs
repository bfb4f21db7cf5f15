//! Writer threads that take dirty files off the write queue and persist them.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info};

use crate::{FileStoreError, PendingFile, PersistentDataStore};

pub type WriterId = usize;

/// The store's handle on one writer thread
#[derive(Debug)]
pub(crate) struct WriterHandle {
    id: WriterId,
    interrupted: Arc<AtomicBool>,
    /// Disconnected once the writer thread has exited
    exited: Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl WriterHandle {
    pub(crate) fn spawn(id: WriterId, store: Arc<PersistentDataStore>) -> std::io::Result<Self> {
        let interrupted = Arc::new(AtomicBool::new(false));
        let (exit_tx, exited) = crossbeam_channel::bounded(0);
        let writer = Writer {
            id,
            store,
            interrupted: Arc::clone(&interrupted),
            _exit_tx: exit_tx,
        };
        let thread = thread::Builder::new()
            .name(format!("tickdb-writer-{id}"))
            .spawn(move || writer.run())?;

        Ok(Self {
            id,
            interrupted,
            exited,
            thread: Some(thread),
        })
    }

    pub(crate) fn id(&self) -> WriterId {
        self.id
    }

    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    pub(crate) fn exit_signal(&self) -> Receiver<()> {
        self.exited.clone()
    }

    pub(crate) fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if let Err(payload) = thread.join() {
                error!(
                    writer = self.id,
                    panic = %panic_message(payload.as_ref()),
                    "writer thread panicked"
                );
            }
        }
    }
}

/// Waits for a writer to exit. `None` waits without a deadline.
pub(crate) fn wait_for_exit(exited: &Receiver<()>, deadline: Option<Instant>) -> bool {
    match deadline {
        None => exited.recv().is_err(),
        Some(deadline) => matches!(
            exited.recv_deadline(deadline),
            Err(RecvTimeoutError::Disconnected)
        ),
    }
}

struct Writer {
    id: WriterId,
    store: Arc<PersistentDataStore>,
    interrupted: Arc<AtomicBool>,
    _exit_tx: Sender<()>,
}

impl Writer {
    fn run(self) {
        let mut guard = ExitGuard {
            id: self.id,
            store: Arc::clone(&self.store),
            clean: false,
        };
        info!(writer = self.id, "writer thread started");

        while let Ok(file) = self.store.next_file(&self.interrupted) {
            if !self.write(&file) {
                return;
            }
        }

        guard.clean = true;
        info!(writer = self.id, "writer thread stopped");
    }

    /// Persists one file and reports the outcome. Returns `false` when the file store panicked,
    /// after which this writer gives up.
    fn write(&self, file: &Arc<PendingFile>) -> bool {
        if !file.is_active() {
            debug!(writer = self.id, %file, "dropping superseded file");
            self.store.file_was_dropped(file);
            return true;
        }

        let file_store = self.store.file_store();
        match panic::catch_unwind(AssertUnwindSafe(|| file_store.store(file))) {
            Ok(Ok(())) => {
                self.store.file_was_stored(file);
                true
            }
            Ok(Err(e)) => {
                self.store.file_has_failed(file, &e);
                true
            }
            Err(payload) => {
                let e = FileStoreError::Panicked(panic_message(payload.as_ref()));
                self.store.file_has_failed(file, &e);
                false
            }
        }
    }
}

/// Reports the writer as failed unless it left its loop through interruption.
struct ExitGuard {
    id: WriterId,
    store: Arc<PersistentDataStore>,
    clean: bool,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if !self.clean {
            error!(writer = self.id, "writer thread died");
            self.store.writer_failed(self.id);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
