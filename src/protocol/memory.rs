//! In-memory link for exercising the connection lifecycle without a radio.
//!
//! [`MemoryConnector`] implements [`Connector`] over blocking in-process pipes. Each
//! successful attempt hands the remote end of the new link to the test as a [`MemoryPeer`]
//! through a channel, so tests can play the robot: send frames, read what the controller
//! wrote, hang up, or make the controller's writes fail.
//!
//! Attempts follow a script of [`Accept`] outcomes, falling back to [`Accept::Connect`] once
//! the script runs out.
use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    time::Duration,
};

use log::trace;
use uuid::Uuid;

use super::{Close, Connector, Frame, FrameDecoder, FrameError, PendingConnect, StreamPair};

#[derive(Default)]
struct PipeState {
    buf: VecDeque<u8>,
    closed: bool,
}

/// One direction of a link. Reads block until bytes arrive or the pipe closes.
#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    readable: Condvar,
}

impl Pipe {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

struct PipeReader(Arc<Pipe>);

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let state = self.0.lock();
        let mut state = self
            .0
            .readable
            .wait_while(state, |s| s.buf.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);

        let n = buf.len().min(state.buf.len());
        for (slot, byte) in buf.iter_mut().zip(state.buf.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

struct PipeWriter {
    pipe: Arc<Pipe>,
    fail: Arc<AtomicBool>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "injected write failure",
            ));
        }
        let mut state = self.pipe.lock();
        if state.closed {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        state.buf.extend(buf);
        drop(state);
        self.pipe.readable.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Closes both directions of a link.
struct LinkCloser {
    inbound: Arc<Pipe>,
    outbound: Arc<Pipe>,
}

impl Close for LinkCloser {
    fn close(&self) {
        self.inbound.close();
        self.outbound.close();
    }
}

/// The robot's end of an in-memory link.
pub struct MemoryPeer {
    decoder: FrameDecoder<PipeReader>,
    to_controller: PipeWriter,
    fail_controller_writes: Arc<AtomicBool>,
    closer: Arc<LinkCloser>,
}

impl MemoryPeer {
    /// Writes raw bytes toward the controller.
    pub fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.to_controller.write_all(bytes)
    }

    /// Blocks until the controller writes a complete frame.
    pub fn read_frame(&mut self) -> Result<Frame, FrameError> {
        self.decoder.next().unwrap_or(Err(FrameError::Closed))
    }

    /// Closes the link from the robot's side.
    pub fn hang_up(&self) {
        self.closer.close();
    }

    /// Makes every later write by the controller fail.
    pub fn fail_writes(&self) {
        self.fail_controller_writes.store(true, Ordering::SeqCst);
    }

    /// Whether either side closed the link.
    pub fn is_closed(&self) -> bool {
        self.closer.inbound.is_closed()
    }
}

/// Outcome of one scripted connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accept {
    /// The link comes up.
    Connect,
    /// The attempt fails with `ConnectionRefused`.
    Refuse,
    /// The attempt blocks until it is cancelled.
    Hold,
}

struct ConnectorState {
    script: VecDeque<Accept>,
    attempts: usize,
}

struct Shared {
    state: Mutex<ConnectorState>,
    attempted: Condvar,
    peers: Mutex<mpsc::Sender<MemoryPeer>>,
}

/// Connector producing in-memory links.
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

impl MemoryConnector {
    /// Returns the connector and the receiver of the robot end of every link it opens.
    pub fn new() -> (Self, mpsc::Receiver<MemoryPeer>) {
        let (tx, rx) = mpsc::channel();
        let shared = Shared {
            state: Mutex::new(ConnectorState {
                script: VecDeque::new(),
                attempts: 0,
            }),
            attempted: Condvar::new(),
            peers: Mutex::new(tx),
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            rx,
        )
    }

    fn lock(&self) -> MutexGuard<'_, ConnectorState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues outcomes for the next attempts.
    pub fn script(&self, outcomes: impl IntoIterator<Item = Accept>) {
        self.lock().script.extend(outcomes);
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    /// Waits until at least `count` attempts have started.
    pub fn wait_for_attempts(&self, count: usize, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .shared
            .attempted
            .wait_timeout_while(state, timeout, |s| s.attempts < count)
            .unwrap_or_else(PoisonError::into_inner);
        state.attempts >= count
    }
}

impl Connector for MemoryConnector {
    fn peer(&self) -> String {
        "memory".to_string()
    }

    fn service_id(&self) -> Uuid {
        Uuid::nil()
    }

    fn begin(&self) -> io::Result<Box<dyn PendingConnect>> {
        let accept = {
            let mut state = self.lock();
            state.attempts += 1;
            state.script.pop_front().unwrap_or(Accept::Connect)
        };
        self.shared.attempted.notify_all();
        trace!("memory attempt scripted as {accept:?}");

        Ok(Box::new(MemoryPending {
            accept,
            gate: Arc::new(Gate::default()),
            shared: self.shared.clone(),
        }))
    }
}

/// Partial handle of an in-memory attempt.
#[derive(Default)]
struct Gate {
    closed: Mutex<bool>,
    changed: Condvar,
}

impl Close for Gate {
    fn close(&self) {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.changed.notify_all();
    }
}

struct MemoryPending {
    accept: Accept,
    gate: Arc<Gate>,
    shared: Arc<Shared>,
}

impl PendingConnect for MemoryPending {
    fn closer(&self) -> Arc<dyn Close> {
        self.gate.clone()
    }

    fn connect(self: Box<Self>) -> io::Result<StreamPair> {
        let aborted = || io::Error::new(io::ErrorKind::ConnectionAborted, "attempt closed");

        match self.accept {
            Accept::Refuse => return Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
            Accept::Hold => {
                let closed = self
                    .gate
                    .closed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let _closed = self
                    .gate
                    .changed
                    .wait_while(closed, |closed| !*closed)
                    .unwrap_or_else(PoisonError::into_inner);
                return Err(aborted());
            }
            Accept::Connect => {
                if *self
                    .gate
                    .closed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                {
                    return Err(aborted());
                }
            }
        }

        let inbound = Arc::new(Pipe::default());
        let outbound = Arc::new(Pipe::default());
        let fail = Arc::new(AtomicBool::new(false));
        let closer = Arc::new(LinkCloser {
            inbound: inbound.clone(),
            outbound: outbound.clone(),
        });

        let peer = MemoryPeer {
            decoder: FrameDecoder::new(PipeReader(outbound.clone())),
            to_controller: PipeWriter {
                pipe: inbound.clone(),
                fail: Arc::new(AtomicBool::new(false)),
            },
            fail_controller_writes: fail.clone(),
            closer: closer.clone(),
        };
        let pair = StreamPair::new(
            Box::new(PipeReader(inbound)),
            Box::new(PipeWriter {
                pipe: outbound,
                fail,
            }),
            closer,
        );

        let peers = self
            .shared
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if peers.send(peer).is_err() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "no peer is listening",
            ));
        }
        Ok(pair)
    }
}
