use std::{
    fmt,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use log::{debug, trace};
use uuid::Uuid;

use crate::config::PeerConfig;

/// Something that can be closed from any thread, unblocking whoever is waiting on it.
pub trait Close: Send + Sync {
    /// Closes the underlying resource. Calling it more than once has no further effect.
    fn close(&self);
}

impl Close for TcpStream {
    fn close(&self) {
        if let Err(e) = self.shutdown(Shutdown::Both) {
            trace!("tcp shutdown: {e}");
        }
    }
}

/// Both ends of one established byte stream, plus a handle that closes them.
pub struct StreamPair {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub closer: Arc<dyn Close>,
}

impl StreamPair {
    pub fn new(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        closer: Arc<dyn Close>,
    ) -> Self {
        Self {
            reader,
            writer,
            closer,
        }
    }

    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        let reader = stream.try_clone()?;
        let closer = stream.try_clone()?;
        Ok(Self::new(
            Box::new(reader),
            Box::new(stream),
            Arc::new(closer),
        ))
    }

    pub fn close(&self) {
        self.closer.close();
    }
}

impl fmt::Debug for StreamPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamPair").finish_non_exhaustive()
    }
}

/// Opens byte streams to the one configured peer.
pub trait Connector: Send + Sync {
    /// Peer address, for logs.
    fn peer(&self) -> String;

    /// Well-known service identifier advertised to the peer.
    fn service_id(&self) -> Uuid;

    /// Allocates the resources for one attempt without blocking on the peer.
    fn begin(&self) -> io::Result<Box<dyn PendingConnect>>;
}

/// One prepared connection attempt.
pub trait PendingConnect: Send {
    /// Handle that aborts the attempt by closing whatever it holds. Closing before or after
    /// [`connect`](PendingConnect::connect) starts must make it fail, or close the stream it
    /// produced.
    fn closer(&self) -> Arc<dyn Close>;

    /// Blocks until the stream is established or the attempt fails.
    fn connect(self: Box<Self>) -> io::Result<StreamPair>;
}

/// Connects to a peer that exposes the robot's serial link as a TCP socket.
///
/// Cancelling while an address is still being dialed cannot interrupt the dial. The worker
/// lingers until the dial ends, at most `connect_timeout`, and closes any stream it produced.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    service_id: Uuid,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>, service_id: Uuid, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            service_id,
            timeout,
        }
    }

    pub fn from_config(config: &PeerConfig) -> Self {
        Self::new(
            config.address.clone(),
            config.service_id,
            config.connect_timeout(),
        )
    }
}

impl Connector for TcpConnector {
    fn peer(&self) -> String {
        self.address.clone()
    }

    fn service_id(&self) -> Uuid {
        self.service_id
    }

    fn begin(&self) -> io::Result<Box<dyn PendingConnect>> {
        let addrs = self.address.to_socket_addrs()?.collect::<Vec<_>>();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("'{}' resolved to no addresses", self.address),
            ));
        }

        Ok(Box::new(TcpPending {
            addrs,
            timeout: self.timeout,
            handle: Arc::new(PartialStream::default()),
        }))
    }
}

struct TcpPending {
    addrs: Vec<SocketAddr>,
    timeout: Duration,
    handle: Arc<PartialStream>,
}

/// The stream of an attempt that may not exist yet.
#[derive(Default)]
struct PartialStream {
    cancelled: AtomicBool,
    stream: Mutex<Option<TcpStream>>,
}

impl Close for PartialStream {
    fn close(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(stream) = stream.as_ref() {
            stream.close();
        }
    }
}

impl PendingConnect for TcpPending {
    fn closer(&self) -> Arc<dyn Close> {
        self.handle.clone()
    }

    fn connect(self: Box<Self>) -> io::Result<StreamPair> {
        let mut last_err = None;

        for addr in &self.addrs {
            if self.handle.cancelled.load(Ordering::SeqCst) {
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "connect cancelled",
                ));
            }

            debug!("dialing {addr}");
            match TcpStream::connect_timeout(addr, self.timeout) {
                Ok(stream) => {
                    *self
                        .handle
                        .stream
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(stream.try_clone()?);

                    if self.handle.cancelled.load(Ordering::SeqCst) {
                        stream.close();
                        return Err(io::Error::new(
                            io::ErrorKind::Interrupted,
                            "connect cancelled",
                        ));
                    }
                    stream.set_nodelay(true)?;
                    return StreamPair::from_tcp(stream);
                }
                Err(e) => {
                    debug!("dialing {addr} failed: {e}");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::NotFound)))
    }
}
