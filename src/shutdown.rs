//! Cooperative cancellation shared between a component and its worker thread.

use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

/// A stop flag that sleeping workers can wait on.
///
/// Unlike a bare `AtomicBool`, `sleep` returns as soon as `stop` is called, so
/// a worker parked in a long backoff does not delay shutdown.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `duration` or until stopped. Returns true if stopped.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let (flag, cvar) = &*self.inner;
        let mut stopped = flag.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *stopped {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = cvar
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            stopped = next;
        }
    }
}

/// Sends on drop, so the owner learns the worker exited even if it panicked.
pub(crate) struct ExitNotice(mpsc::Sender<()>);

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

/// A worker thread plus the channel that reports its exit.
pub(crate) struct Worker {
    name: &'static str,
    join: JoinHandle<()>,
    exited: mpsc::Receiver<()>,
}

impl Worker {
    /// Spawn a named thread. `body` receives the notice it must keep alive for
    /// its whole run.
    pub(crate) fn spawn<F>(name: &'static str, body: F) -> Result<Self>
    where
        F: FnOnce(ExitNotice) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let notice = ExitNotice(tx);
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(notice))
            .map_err(|e| anyhow!("failed to spawn {} thread: {}", name, e))?;
        Ok(Self {
            name,
            join,
            exited: rx,
        })
    }

    /// Wait up to `timeout` for the thread to exit, then join it.
    pub(crate) fn join_within(self, timeout: Duration) -> Result<()> {
        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {}
            Err(mpsc::RecvTimeoutError::Timeout) => {
                return Err(anyhow!(
                    "{} thread did not exit within {:?}",
                    self.name,
                    timeout
                ));
            }
        }
        self.join
            .join()
            .map_err(|_| anyhow!("{} thread panicked", self.name))
    }
}
