//! Scriptable collaborators for exercising the store in tests.

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use crate::{
    EmergencyShutdownControl, FileStore, FileStoreError, PendingFile, file_store::Result,
};

#[derive(Debug, Default)]
struct Script {
    stored: HashMap<String, Bytes>,
    attempts: HashMap<String, u32>,
    fail_remaining: HashMap<String, u32>,
    always_fail: bool,
    panic_on: HashSet<String>,
}

#[derive(Debug)]
struct Gate {
    entered_tx: Sender<String>,
    entered_rx: Receiver<String>,
    permits_tx: Sender<()>,
    permits_rx: Receiver<()>,
}

/// An in-memory [`FileStore`] whose outcomes are scripted per path
///
/// A gated store blocks every `store` call until it is let through with [`allow`](Self::allow),
/// which lets a test hold writers at a known point.
#[derive(Debug, Default)]
pub struct ScriptedFileStore {
    script: Mutex<Script>,
    gate: Option<Gate>,
}

impl ScriptedFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> Self {
        let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
        let (permits_tx, permits_rx) = crossbeam_channel::unbounded();
        Self {
            script: Default::default(),
            gate: Some(Gate {
                entered_tx,
                entered_rx,
                permits_tx,
                permits_rx,
            }),
        }
    }

    /// The next `n` writes of `path` fail.
    pub fn fail_times(&self, path: &str, n: u32) {
        self.script
            .lock()
            .fail_remaining
            .insert(path.to_string(), n);
    }

    pub fn set_always_fail(&self, always_fail: bool) {
        self.script.lock().always_fail = always_fail;
    }

    /// Writes of `path` panic.
    pub fn panic_on(&self, path: &str) {
        self.script.lock().panic_on.insert(path.to_string());
    }

    /// Waits until a `store` call reached the gate and returns the path it carries.
    pub fn wait_entered_path(&self, timeout: Duration) -> Option<String> {
        self.gate
            .as_ref()
            .and_then(|gate| gate.entered_rx.recv_timeout(timeout).ok())
    }

    pub fn wait_entered(&self, timeout: Duration) -> bool {
        self.wait_entered_path(timeout).is_some()
    }

    /// Lets `n` gated `store` calls proceed.
    pub fn allow(&self, n: usize) {
        if let Some(gate) = &self.gate {
            for _ in 0..n {
                let _ = gate.permits_tx.send(());
            }
        }
    }

    /// Number of `store` calls made for `path`
    pub fn attempts(&self, path: &str) -> u32 {
        self.script
            .lock()
            .attempts
            .get(path)
            .copied()
            .unwrap_or_default()
    }

    pub fn total_attempts(&self) -> u32 {
        self.script.lock().attempts.values().sum()
    }

    pub fn stored_paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.script.lock().stored.keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl FileStore for ScriptedFileStore {
    fn store(&self, file: &PendingFile) -> Result<()> {
        if let Some(gate) = &self.gate {
            let _ = gate.entered_tx.send(file.path().to_string());
            gate.permits_rx
                .recv()
                .map_err(|_| FileStoreError::Unavailable("gate closed".to_string()))?;
        }

        let mut script = self.script.lock();
        *script.attempts.entry(file.path().to_string()).or_default() += 1;

        if script.panic_on.contains(file.path()) {
            drop(script);
            panic!("scripted panic storing {}", file.path());
        }
        if script.always_fail {
            return Err(FileStoreError::Unavailable("scripted failure".to_string()));
        }
        if let Some(remaining) = script.fail_remaining.get_mut(file.path()) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FileStoreError::Unavailable(format!(
                    "scripted failure storing {}",
                    file.path()
                )));
            }
        }

        let data = file
            .data()
            .ok_or_else(|| FileStoreError::NoContent(file.path().to_string()))?;
        // copied so that the file's own buffer stays uniquely owned
        script
            .stored
            .insert(file.path().to_string(), Bytes::copy_from_slice(&data));
        Ok(())
    }

    fn load(&self, path: &str) -> Result<Bytes> {
        self.script
            .lock()
            .stored
            .get(path)
            .cloned()
            .ok_or_else(|| FileStoreError::Unavailable(format!("{path} not found")))
    }
}

/// An [`EmergencyShutdownControl`] that only counts how often it was triggered
#[derive(Debug, Default)]
pub struct CountingShutdownControl {
    triggered: AtomicUsize,
}

impl CountingShutdownControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.triggered.load(Ordering::SeqCst)
    }
}

impl EmergencyShutdownControl for CountingShutdownControl {
    fn trigger_emergency_shutdown(&self) {
        self.triggered.fetch_add(1, Ordering::SeqCst);
    }
}
