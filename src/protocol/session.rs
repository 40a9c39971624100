use std::{
    fmt, io,
    io::{Read, Write},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, trace};

use super::{Close, Frame, FrameDecoder, LinkError, StreamPair, WorkerCount};

/// One live stream pair: a read worker decoding inbound frames and a serialized write path.
///
/// The session never retries or reconnects; its owner decides what a failure means.
pub struct TransportSession {
    id: u64,
    writer: Mutex<Box<dyn Write + Send>>,
    closer: Arc<dyn Close>,
    closed: Arc<AtomicBool>,
}

impl TransportSession {
    /// Starts the read worker over `pair`.
    ///
    /// `on_frame` runs on the worker for every complete frame, in wire order. `on_error` runs
    /// exactly once when the read side ends, including after [`close`](Self::close). Neither
    /// should block for long.
    pub fn start<F, E>(
        id: u64,
        pair: StreamPair,
        max_frame_len: Option<usize>,
        workers: &WorkerCount,
        on_frame: F,
        on_error: E,
    ) -> io::Result<Self>
    where
        F: FnMut(Frame) + Send + 'static,
        E: FnOnce(LinkError) + Send + 'static,
    {
        let StreamPair {
            reader,
            writer,
            closer,
        } = pair;
        let closed = Arc::new(AtomicBool::new(false));
        let read_closed = closed.clone();

        if let Err(e) = workers.spawn(format!("botlink-read-{id}"), move || {
            read_loop(id, reader, max_frame_len, &read_closed, on_frame, on_error)
        }) {
            closer.close();
            return Err(e);
        }

        debug!("session {id} started");
        Ok(Self {
            id,
            writer: Mutex::new(writer),
            closer,
            closed,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Writes `bytes` in full. Concurrent writers are serialized.
    pub fn write(&self, bytes: &[u8]) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::WriteFailed(io::Error::new(
                io::ErrorKind::NotConnected,
                "session closed",
            )));
        }

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer
            .write_all(bytes)
            .and_then(|_| writer.flush())
            .map_err(LinkError::WriteFailed)?;
        trace!("session {} wrote {} bytes", self.id, bytes.len());
        Ok(())
    }

    /// Closes both directions, which ends the read worker. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("closing session {}", self.id);
            self.closer.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn read_loop<F, E>(
    id: u64,
    reader: Box<dyn Read + Send>,
    max_frame_len: Option<usize>,
    closed: &AtomicBool,
    mut on_frame: F,
    on_error: E,
) where
    F: FnMut(Frame),
    E: FnOnce(LinkError),
{
    let mut decoder = FrameDecoder::with_max_len(reader, max_frame_len);

    let cause = loop {
        match decoder.next() {
            Some(Ok(frame)) => {
                if closed.load(Ordering::SeqCst) {
                    break closed_locally();
                }
                debug!("session {id} received '{frame}'");
                on_frame(frame);
            }
            Some(Err(e)) if closed.load(Ordering::SeqCst) => {
                trace!("session {id} read ended after close: {e}");
                break closed_locally();
            }
            Some(Err(e)) => break LinkError::from(e),
            None => break closed_locally(),
        }
    };

    debug!("session {id} read loop terminated: {cause}");
    on_error(cause);
}

fn closed_locally() -> LinkError {
    LinkError::ReadTerminated(io::Error::new(
        io::ErrorKind::ConnectionAborted,
        "session closed",
    ))
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, thread, time::Duration};

    use super::*;
    use crate::protocol::{Connector, PendingConnect, memory::{MemoryConnector, MemoryPeer}};

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        session: TransportSession,
        peer: MemoryPeer,
        frames: mpsc::Receiver<Frame>,
        errors: mpsc::Receiver<LinkError>,
        workers: WorkerCount,
    }

    fn start(max_frame_len: Option<usize>) -> Harness {
        let (connector, peers) = MemoryConnector::new();
        let pending: Box<dyn PendingConnect> = connector.begin().unwrap();
        let pair = pending.connect().unwrap();
        let peer = peers.try_recv().unwrap();
        let workers = WorkerCount::new();
        let (frame_tx, frames) = mpsc::channel();
        let (error_tx, errors) = mpsc::channel();

        let session = TransportSession::start(
            1,
            pair,
            max_frame_len,
            &workers,
            move |frame| frame_tx.send(frame).unwrap(),
            move |err| error_tx.send(err).unwrap(),
        )
        .unwrap();

        Harness {
            session,
            peer,
            frames,
            errors,
            workers,
        }
    }

    #[test]
    fn delivers_frames_in_order() {
        let mut h = start(None);

        h.peer.send(b"F1;F2;").unwrap();
        h.peer.send(b"F3;F4").unwrap();

        for expected in ["F1", "F2", "F3"] {
            assert_eq!(h.frames.recv_timeout(WAIT).unwrap().payload(), expected);
        }
        assert!(h.frames.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn write_reaches_peer() {
        let mut h = start(None);

        h.session.write(b"S;").unwrap();
        assert_eq!(h.peer.read_frame().unwrap(), Frame::tag_only('S'));
    }

    #[test]
    fn concurrent_writes_do_not_interleave() {
        let mut h = start(None);
        let session = Arc::new(h.session);

        let writers = (0..4)
            .map(|i| {
                let session = session.clone();
                thread::spawn(move || {
                    let frame = Frame::new('E', [i; 16]);
                    for _ in 0..25 {
                        session.write(&frame.encode()).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for writer in writers {
            writer.join().unwrap();
        }

        for _ in 0..100 {
            let frame = h.peer.read_frame().unwrap();
            let fields = frame.fields().collect::<Vec<_>>();
            assert_eq!(fields.len(), 16);
            assert!(fields.iter().all(|f| *f == fields[0]));
        }
    }

    #[test]
    fn peer_hang_up_reports_once() {
        let h = start(None);

        h.peer.hang_up();

        assert!(matches!(
            h.errors.recv_timeout(WAIT),
            Ok(LinkError::ReadTerminated(_))
        ));
        assert!(h.workers.wait_idle(WAIT));
        assert!(h.errors.try_recv().is_err());
    }

    #[test]
    fn close_ends_read_worker() {
        let h = start(None);

        h.session.close();
        h.session.close();

        assert!(matches!(
            h.errors.recv_timeout(WAIT),
            Ok(LinkError::ReadTerminated(_))
        ));
        assert!(h.workers.wait_idle(WAIT));
        assert!(h.peer.is_closed());
        assert!(matches!(
            h.session.write(b"S;"),
            Err(LinkError::WriteFailed(_))
        ));
    }

    #[test]
    fn oversized_frame_fails_session() {
        let mut h = start(Some(8));

        h.peer.send(b"short;this frame is too long;").unwrap();

        assert_eq!(h.frames.recv_timeout(WAIT).unwrap().payload(), "short");
        assert!(matches!(
            h.errors.recv_timeout(WAIT),
            Ok(LinkError::FrameTooLarge { limit: 8 })
        ));
    }

    #[test]
    fn failed_write_is_reported() {
        let h = start(None);

        h.peer.fail_writes();

        assert!(matches!(
            h.session.write(b"S;"),
            Err(LinkError::WriteFailed(_))
        ));
    }
}
