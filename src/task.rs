//! Long-lived background loops with cooperative stop
//!
//! Each task is a named OS thread running a closure every `interval`. The
//! stop flag is checked at every iteration boundary; a call already in
//! progress runs to completion.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Cancellation flag shared between a task and its owner
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let (stopped, cond) = &*self.inner;
        *stopped.lock() = true;
        cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleep up to `timeout`; returns true as soon as stop is requested
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (stopped, cond) = &*self.inner;
        let deadline = Instant::now().checked_add(timeout);
        let mut guard = stopped.lock();
        while !*guard {
            match deadline {
                Some(deadline) => {
                    if cond.wait_until(&mut guard, deadline).timed_out() {
                        break;
                    }
                }
                // Unrepresentable deadline: wait for stop only
                None => cond.wait(&mut guard),
            }
        }
        *guard
    }
}

/// Handle to a periodic background thread
pub struct BackgroundTask {
    name: String,
    token: StopToken,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Spawn `tick` every `interval` until stopped
    ///
    /// Errors returned by `tick` are logged and the loop continues.
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let token = StopToken::new();
        let loop_token = token.clone();
        let task_name = name.to_string();

        let handle = thread::Builder::new()
            .name(format!("memwarden-{}", name))
            .spawn(move || {
                debug!(task = %task_name, interval_ms = interval.as_millis() as u64, "Background task started");
                while !loop_token.wait_timeout(interval) {
                    if let Err(e) = tick() {
                        error!(task = %task_name, error = %e, "Background cycle failed");
                    }
                }
                debug!(task = %task_name, "Background task exiting");
            })
            .map_err(|e| Error::Internal(format!("failed to spawn {} thread: {}", name, e)))?;

        info!(task = name, "Started background task");
        Ok(Self {
            name: name.to_string(),
            token,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> StopToken {
        self.token.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Request stop without waiting
    pub fn stop(&self) {
        self.token.stop();
    }

    /// Request stop and wait for the thread to exit
    pub fn join(&mut self) {
        self.token.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(task = %self.name, "Background task panicked");
            } else {
                debug!(task = %self.name, "Background task joined");
            }
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.join();
    }
}
