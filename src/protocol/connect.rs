use std::{
    fmt, io,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use log::{debug, info};

use super::{Close, Connector, LinkError, StreamPair, WorkerCount};

#[derive(Default)]
struct TokenState {
    cancelled: bool,
    handle: Option<Arc<dyn Close>>,
}

/// Cancellation shared between an attempt's worker and its owner.
///
/// Cancelling closes the partial handle the worker registered, which makes its blocking
/// connect fail. A handle registered after cancellation is closed on registration.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<TokenState>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, TokenState> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cancel(&self) {
        let handle = {
            let mut state = self.state();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.handle.take()
        };
        self.inner.1.notify_all();

        if let Some(handle) = handle {
            handle.close();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state().cancelled
    }

    /// Sleeps for `delay` unless cancelled first. Returns `true` if cancelled.
    pub fn wait(&self, delay: Duration) -> bool {
        let state = self.state();
        let (state, _) = self
            .inner
            .1
            .wait_timeout_while(state, delay, |state| !state.cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        state.cancelled
    }

    /// Registers the handle to close on cancellation. Returns `false`, having closed the
    /// handle, if the token is already cancelled.
    pub fn attach(&self, handle: Arc<dyn Close>) -> bool {
        let mut state = self.state();
        if state.cancelled {
            drop(state);
            handle.close();
            return false;
        }
        state.handle = Some(handle);
        true
    }

    /// Forgets the registered handle once it owns a live stream. Returns `false` if the token
    /// was cancelled in the meantime.
    pub fn detach(&self) -> bool {
        let mut state = self.state();
        state.handle = None;
        !state.cancelled
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// One in-flight connection attempt running on its own worker.
///
/// Exactly one of `on_success` or `on_failure` runs, on the worker thread.
#[derive(Debug)]
pub struct ConnectAttempt {
    id: u64,
    token: CancelToken,
}

impl ConnectAttempt {
    pub fn spawn<S, F>(
        id: u64,
        connector: Arc<dyn Connector>,
        delay: Duration,
        workers: &WorkerCount,
        on_success: S,
        on_failure: F,
    ) -> io::Result<Self>
    where
        S: FnOnce(StreamPair) + Send + 'static,
        F: FnOnce(LinkError) + Send + 'static,
    {
        let token = CancelToken::new();
        let worker_token = token.clone();

        workers.spawn(format!("botlink-connect-{id}"), move || {
            match attempt(connector.as_ref(), &worker_token, delay) {
                Ok(pair) => on_success(pair),
                Err(e) => on_failure(LinkError::ConnectFailed(e)),
            }
        })?;

        Ok(Self { id, token })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Aborts the attempt. The worker still reports through `on_failure`, possibly later.
    pub fn cancel(&self) {
        debug!("cancelling connect attempt {}", self.id);
        self.token.cancel();
    }
}

fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "connect attempt cancelled")
}

fn attempt(
    connector: &dyn Connector,
    token: &CancelToken,
    delay: Duration,
) -> io::Result<StreamPair> {
    if !delay.is_zero() {
        debug!("waiting {delay:?} before connecting");
        if token.wait(delay) {
            return Err(cancelled());
        }
    }
    if token.is_cancelled() {
        return Err(cancelled());
    }

    info!(
        "connecting to {} (service {})",
        connector.peer(),
        connector.service_id()
    );
    let pending = connector.begin()?;
    if !token.attach(pending.closer()) {
        return Err(cancelled());
    }

    let pair = pending.connect()?;
    if !token.detach() {
        pair.close();
        return Err(cancelled());
    }
    Ok(pair)
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use uuid::Uuid;

    use super::*;
    use crate::protocol::{PendingConnect, memory::{Accept, MemoryConnector}};

    const WAIT: Duration = Duration::from_secs(5);

    enum Outcome {
        Success(StreamPair),
        Failure(LinkError),
    }

    fn run(
        connector: impl Connector + 'static,
        delay: Duration,
        workers: &WorkerCount,
    ) -> (ConnectAttempt, mpsc::Receiver<Outcome>) {
        let (tx, rx) = mpsc::channel();
        let failed = tx.clone();
        let attempt = ConnectAttempt::spawn(
            7,
            Arc::new(connector),
            delay,
            workers,
            move |pair| tx.send(Outcome::Success(pair)).unwrap(),
            move |err| failed.send(Outcome::Failure(err)).unwrap(),
        )
        .unwrap();
        (attempt, rx)
    }

    #[test]
    fn attempt_succeeds() {
        let (connector, peers) = MemoryConnector::new();
        let workers = WorkerCount::new();

        let (attempt, outcome) = run(connector.clone(), Duration::ZERO, &workers);
        assert_eq!(attempt.id(), 7);

        assert!(matches!(
            outcome.recv_timeout(WAIT),
            Ok(Outcome::Success(_))
        ));
        assert!(peers.recv_timeout(WAIT).is_ok());
        assert!(workers.wait_idle(WAIT));
    }

    #[test]
    fn attempt_reports_refusal() {
        let (connector, _peers) = MemoryConnector::new();
        connector.script([Accept::Refuse]);
        let workers = WorkerCount::new();

        let (_attempt, outcome) = run(connector.clone(), Duration::ZERO, &workers);

        match outcome.recv_timeout(WAIT).unwrap() {
            Outcome::Failure(LinkError::ConnectFailed(e)) => {
                assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused)
            }
            _ => panic!("expected a refused connection"),
        }
        assert!(workers.wait_idle(WAIT));
    }

    #[test]
    fn cancel_unblocks_held_attempt() {
        let (connector, _peers) = MemoryConnector::new();
        connector.script([Accept::Hold]);
        let workers = WorkerCount::new();

        let (attempt, outcome) = run(connector.clone(), Duration::ZERO, &workers);
        connector.wait_for_attempts(1, WAIT);
        attempt.cancel();

        assert!(matches!(
            outcome.recv_timeout(WAIT),
            Ok(Outcome::Failure(LinkError::ConnectFailed(_)))
        ));
        assert!(workers.wait_idle(WAIT));
    }

    #[test]
    fn cancel_interrupts_delay() {
        let (connector, _peers) = MemoryConnector::new();
        let workers = WorkerCount::new();

        let (attempt, outcome) = run(connector.clone(), Duration::from_secs(60), &workers);
        attempt.cancel();

        assert!(matches!(
            outcome.recv_timeout(WAIT),
            Ok(Outcome::Failure(LinkError::ConnectFailed(_)))
        ));
        assert_eq!(connector.attempts(), 0);
    }

    #[test]
    fn token_closes_late_handle() {
        struct Flag(Mutex<bool>);
        impl Close for Flag {
            fn close(&self) {
                *self.0.lock().unwrap() = true;
            }
        }

        let token = CancelToken::new();
        token.cancel();
        let flag = Arc::new(Flag(Mutex::new(false)));

        assert!(!token.attach(flag.clone()));
        assert!(*flag.0.lock().unwrap());
        assert!(!token.detach());
    }

    /// Close handle that cannot interrupt a dial already in progress.
    struct Unheard;

    impl Close for Unheard {
        fn close(&self) {}
    }

    /// Opens in-memory links whose dial completes only when the test releases it.
    struct LateConnector {
        link: MemoryConnector,
        dialing: mpsc::Sender<()>,
        release: Mutex<Option<mpsc::Receiver<()>>>,
    }

    impl Connector for LateConnector {
        fn peer(&self) -> String {
            "late".to_string()
        }

        fn service_id(&self) -> Uuid {
            Uuid::nil()
        }

        fn begin(&self) -> io::Result<Box<dyn PendingConnect>> {
            let release = self.release.lock().unwrap().take().unwrap();
            Ok(Box::new(LatePending {
                inner: self.link.begin()?,
                dialing: self.dialing.clone(),
                release,
            }))
        }
    }

    struct LatePending {
        inner: Box<dyn PendingConnect>,
        dialing: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
    }

    impl PendingConnect for LatePending {
        fn closer(&self) -> Arc<dyn Close> {
            Arc::new(Unheard)
        }

        fn connect(self: Box<Self>) -> io::Result<StreamPair> {
            self.dialing.send(()).unwrap();
            let _ = self.release.recv();
            self.inner.connect()
        }
    }

    #[test]
    fn stream_completed_after_cancel_is_closed() {
        let (link, peers) = MemoryConnector::new();
        let (dialing_tx, dialing) = mpsc::channel();
        let (release, release_rx) = mpsc::channel();
        let connector = LateConnector {
            link,
            dialing: dialing_tx,
            release: Mutex::new(Some(release_rx)),
        };
        let workers = WorkerCount::new();

        let (attempt, outcome) = run(connector, Duration::ZERO, &workers);
        dialing.recv_timeout(WAIT).unwrap();
        attempt.cancel();
        release.send(()).unwrap();

        assert!(matches!(
            outcome.recv_timeout(WAIT),
            Ok(Outcome::Failure(LinkError::ConnectFailed(_)))
        ));
        let peer = peers.recv_timeout(WAIT).unwrap();
        assert!(peer.is_closed());
        assert!(workers.wait_idle(WAIT));
    }
}
