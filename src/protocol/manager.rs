use std::{
    fmt, io,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak, mpsc},
    time::Duration,
};

use log::{debug, error, info, warn};

use crate::config::{LinkConfig, ReconnectPolicy};

use super::{
    ConnectAttempt, Connector, Frame, LinkError, StreamPair, TransportSession, WorkerCount,
};

/// Where the link is in its lifecycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No attempt and no session.
    #[default]
    Idle,
    /// One attempt outstanding, no session.
    Connecting,
    /// One live session.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

type FrameHandler = Arc<dyn Fn(Frame) + Send + Sync>;
type StateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Shared mutable state. Only ever touched under [`Inner::link`].
#[derive(Default)]
struct Link {
    state: ConnectionState,
    attempt: Option<ConnectAttempt>,
    session: Option<Arc<TransportSession>>,
    generation: u64,
    reconnects: u32,
}

impl Link {
    /// Cancels the attempt and closes the session, leaving the link idle.
    fn shutdown(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            attempt.cancel();
        }
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.state = ConnectionState::Idle;
    }

    fn attempt_id(&self) -> Option<u64> {
        self.attempt.as_ref().map(ConnectAttempt::id)
    }

    fn session_id(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.id())
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    max_frame_len: Option<usize>,
    reconnect: ReconnectPolicy,
    workers: WorkerCount,
    link: Mutex<Link>,
    on_frame: RwLock<Option<FrameHandler>>,
    on_state: RwLock<Option<StateHandler>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.link
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown();
    }
}

/// Owns the connection to the peer: at most one connect attempt and at most one session.
///
/// Cloning yields another handle to the same manager. Workers only hold weak references, so
/// dropping the last handle closes the link.
///
/// ```no_run
/// use botlink::{LinkConfig, protocol::{ConnectionManager, Frame, TcpConnector}};
///
/// let config = LinkConfig::default();
/// let manager = ConnectionManager::new(TcpConnector::from_config(&config.peer), &config);
/// let frames = manager.frames();
///
/// manager.connect().unwrap();
/// // ... once connected:
/// let _ = manager.send(&Frame::tag_only('S'));
/// while let Ok(frame) = frames.recv() {
///     println!("robot says {frame}");
/// }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

/// Handle that does not keep the manager alive. Meant for the manager's own callbacks.
#[derive(Clone)]
pub struct WeakConnectionManager {
    inner: Weak<Inner>,
}

impl WeakConnectionManager {
    pub fn upgrade(&self) -> Option<ConnectionManager> {
        self.inner
            .upgrade()
            .map(|inner| ConnectionManager { inner })
    }
}

impl ConnectionManager {
    pub fn new<C>(connector: C, config: &LinkConfig) -> Self
    where
        C: Connector + 'static,
    {
        Self::with_connector(Arc::new(connector), config)
    }

    pub fn with_connector(connector: Arc<dyn Connector>, config: &LinkConfig) -> Self {
        let inner = Inner {
            connector,
            max_frame_len: config.link.max_frame_len,
            reconnect: config.reconnect.clone(),
            workers: WorkerCount::new(),
            link: Mutex::new(Link::default()),
            on_frame: RwLock::new(None),
            on_state: RwLock::new(None),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn downgrade(&self) -> WeakConnectionManager {
        WeakConnectionManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Registers the consumer of inbound frames. It runs on the session's read worker, so it
    /// should hand frames off rather than block. Register before [`connect`](Self::connect).
    pub fn on_frame<F>(&self, handler: F)
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        let mut slot = self
            .inner
            .on_frame
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            warn!("replacing the registered frame consumer");
        }
        *slot = Some(Arc::new(handler));
    }

    /// Registers a channel as the frame consumer and returns its receiving end.
    pub fn frames(&self) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel();
        self.on_frame(move |frame| {
            if tx.send(frame).is_err() {
                debug!("frame receiver dropped");
            }
        });
        rx
    }

    /// Registers a listener for state transitions. It runs on whichever thread made the
    /// transition, never while the manager's lock is held.
    pub fn on_state_change<F>(&self, handler: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        *self
            .inner
            .on_state
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Probe of the connect and read workers currently running.
    pub fn workers(&self) -> &WorkerCount {
        &self.inner.workers
    }

    /// Starts a new connection attempt, first cancelling any outstanding attempt and closing
    /// any live session. Returns once the attempt is running; the outcome arrives through
    /// [`state`](Self::state) and [`on_state_change`](Self::on_state_change).
    pub fn connect(&self) -> Result<(), LinkError> {
        let mut link = self.lock();
        let previous = link.state;
        let started = self.start_attempt(&mut link, Duration::ZERO);
        let current = link.state;
        drop(link);

        self.notify(previous, ConnectionState::Idle);
        self.notify(ConnectionState::Idle, current);
        started.map_err(|e| {
            error!("failed to spawn connect worker: {e}");
            LinkError::ConnectFailed(e)
        })
    }

    /// Cancels any attempt, closes any session and leaves the link idle. Idempotent.
    pub fn close(&self) {
        let mut link = self.lock();
        let previous = link.state;
        link.shutdown();
        drop(link);

        if previous != ConnectionState::Idle {
            info!("link to {} closed", self.inner.connector.peer());
        }
        self.notify(previous, ConnectionState::Idle);
    }

    pub fn send(&self, frame: &Frame) -> Result<(), LinkError> {
        self.send_raw(&frame.encode())
    }

    /// Writes already delimited bytes, e.g. several frames in one write.
    ///
    /// Fails with [`LinkError::NotConnected`] without blocking when there is no session. A
    /// failed write ends the session and may start a reconnect per the [`ReconnectPolicy`].
    pub fn send_raw(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let session = {
            let link = self.lock();
            match (&link.session, link.state) {
                (Some(session), ConnectionState::Connected) => session.clone(),
                _ => {
                    debug!(
                        "dropping {} outbound bytes; link is {}",
                        bytes.len(),
                        link.state
                    );
                    return Err(LinkError::NotConnected);
                }
            }
        };

        if let Err(err) = session.write(bytes) {
            self.write_failed(session.id(), &err);
            return Err(err);
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Link> {
        self.inner
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, previous: ConnectionState, current: ConnectionState) {
        if previous == current {
            return;
        }
        info!("link {previous} -> {current}");

        let handler = self
            .inner
            .on_state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler(current);
        }
    }

    fn start_attempt(&self, link: &mut Link, delay: Duration) -> io::Result<()> {
        link.shutdown();
        link.generation += 1;
        let id = link.generation;

        let succeeded = self.downgrade();
        let failed = self.downgrade();
        let attempt = ConnectAttempt::spawn(
            id,
            self.inner.connector.clone(),
            delay,
            &self.inner.workers,
            move |pair| match succeeded.upgrade() {
                Some(manager) => manager.attempt_succeeded(id, pair),
                None => pair.close(),
            },
            move |err| {
                if let Some(manager) = failed.upgrade() {
                    manager.attempt_failed(id, err);
                }
            },
        )?;

        link.attempt = Some(attempt);
        link.state = ConnectionState::Connecting;
        Ok(())
    }

    fn attempt_succeeded(&self, id: u64, pair: StreamPair) {
        let mut link = self.lock();
        if link.attempt_id() != Some(id) {
            drop(link);
            debug!("discarding stream from superseded attempt {id}");
            pair.close();
            return;
        }

        link.attempt = None;
        let previous = link.state;
        let frames = self.downgrade();
        let ended = self.downgrade();
        let started = TransportSession::start(
            id,
            pair,
            self.inner.max_frame_len,
            &self.inner.workers,
            move |frame| {
                if let Some(manager) = frames.upgrade() {
                    manager.deliver(frame);
                }
            },
            move |cause| {
                if let Some(manager) = ended.upgrade() {
                    manager.session_ended(id, cause);
                }
            },
        );

        match started {
            Ok(session) => {
                link.session = Some(Arc::new(session));
                link.state = ConnectionState::Connected;
                link.reconnects = 0;
                info!(
                    "session {id} established with {}",
                    self.inner.connector.peer()
                );
            }
            Err(e) => {
                error!("failed to start read worker for session {id}: {e}");
                link.state = ConnectionState::Idle;
            }
        }
        let current = link.state;
        drop(link);

        self.notify(previous, current);
    }

    fn attempt_failed(&self, id: u64, err: LinkError) {
        let mut link = self.lock();
        if link.attempt_id() != Some(id) {
            debug!("superseded attempt {id} ended: {err}");
            return;
        }
        link.attempt = None;
        let previous = link.state;
        link.state = ConnectionState::Idle;
        drop(link);

        warn!(
            "connect attempt {id} to {} failed: {err}",
            self.inner.connector.peer()
        );
        self.notify(previous, ConnectionState::Idle);
    }

    fn deliver(&self, frame: Frame) {
        let handler = self
            .inner
            .on_frame
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => handler(frame),
            None => debug!("no frame consumer registered; dropping '{frame}'"),
        }
    }

    fn session_ended(&self, id: u64, cause: LinkError) {
        let mut link = self.lock();
        if link.session_id() != Some(id) {
            debug!("replaced session {id} ended: {cause}");
            return;
        }
        if let Some(session) = link.session.take() {
            session.close();
        }
        let previous = link.state;
        link.state = ConnectionState::Idle;
        drop(link);

        warn!("session {id} ended: {cause}");
        self.notify(previous, ConnectionState::Idle);
    }

    fn write_failed(&self, id: u64, err: &LinkError) {
        let mut link = self.lock();
        if link.session_id() != Some(id) {
            return;
        }
        let previous = link.state;
        if let Some(session) = link.session.take() {
            session.close();
        }
        link.state = ConnectionState::Idle;

        let policy = &self.inner.reconnect;
        if link.reconnects < policy.max_attempts {
            link.reconnects += 1;
            warn!(
                "session {id}: {err}; reconnecting (attempt {} of {})",
                link.reconnects, policy.max_attempts
            );
            if let Err(e) = self.start_attempt(&mut link, policy.delay()) {
                error!("failed to spawn connect worker: {e}");
            }
        } else {
            warn!("session {id}: {err}; not reconnecting");
        }
        let current = link.state;
        drop(link);

        self.notify(previous, ConnectionState::Idle);
        self.notify(ConnectionState::Idle, current);
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("peer", &self.inner.connector.peer())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
