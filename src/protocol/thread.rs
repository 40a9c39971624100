use std::{
    io,
    sync::{Arc, Condvar, Mutex, PoisonError},
    thread,
    time::Duration,
};

use log::debug;

/// Counts the link's running workers.
///
/// Every connect and read worker is spawned through [`WorkerCount::spawn`] and decrements the
/// count when its thread exits, however it exits. A count that returns to zero after
/// [`close`](super::ConnectionManager::close) proves no worker leaked.
#[derive(Debug, Clone, Default)]
pub struct WorkerCount {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

impl WorkerCount {
    pub fn new() -> Self {
        Self::default()
    }

    /// Workers currently running.
    pub fn live(&self) -> usize {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until no worker is running. Returns `false` if `timeout` elapsed first.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let (lock, idle) = &*self.inner;
        let count = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (count, _) = idle
            .wait_timeout_while(count, timeout, |count| *count > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *count == 0
    }

    /// Runs `job` on a new named thread.
    pub(crate) fn spawn<F>(&self, name: String, job: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner) += 1;

        // Dropped with the closure if the thread never starts.
        let worker = Worker {
            name: name.clone(),
            count: self.clone(),
        };

        thread::Builder::new().name(name).spawn(move || {
            debug!("worker {} started", worker.name);
            job();
            drop(worker);
        })?;
        Ok(())
    }
}

#[derive(Debug)]
struct Worker {
    name: String,
    count: WorkerCount,
}

impl Drop for Worker {
    fn drop(&mut self) {
        let (lock, idle) = &*self.count.inner;
        let mut count = lock.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        debug!("worker {} exited", self.name);
        idle.notify_all();
    }
}
