//! Lazily-dialed TCP connection.
//!
//! The dial runs in the background once [`EventualConn::trigger_dial`] is
//! called; reads and writes issued at any point transparently wait for it
//! to finish, bounded by the timeout given at construction. The dial
//! outcome is also reported on a one-shot channel to whoever triggered it.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, oneshot, watch};
use tracing::trace;

use crate::error::ConnError;

/// Dial progress broadcast to waiting reads and writes.
#[derive(Debug, Clone)]
enum DialState {
    Pending,
    Ready,
    Failed(DialFailure),
}

/// Cloneable record of why the dial failed, replayed to every waiter.
///
/// `io::Error` is not `Clone`, so failures are kept as kind + message and
/// each waiter gets an equivalent reconstructed error.
#[derive(Debug, Clone)]
enum DialFailure {
    DnsHijacked,
    TimedOut(Duration),
    UnsupportedNetwork(String),
    Io(io::ErrorKind, String),
    Closed,
}

impl From<&ConnError> for DialFailure {
    fn from(err: &ConnError) -> Self {
        match err {
            ConnError::DnsHijacked => DialFailure::DnsHijacked,
            ConnError::DialTimeout(timeout) => DialFailure::TimedOut(*timeout),
            ConnError::UnsupportedNetwork(network) => {
                DialFailure::UnsupportedNetwork(network.clone())
            }
            ConnError::Io(e) => DialFailure::Io(e.kind(), e.to_string()),
            ConnError::Closed => DialFailure::Closed,
            other => DialFailure::Io(io::ErrorKind::Other, other.to_string()),
        }
    }
}

impl From<DialFailure> for ConnError {
    fn from(failure: DialFailure) -> Self {
        match failure {
            DialFailure::DnsHijacked => ConnError::DnsHijacked,
            DialFailure::TimedOut(timeout) => ConnError::DialTimeout(timeout),
            DialFailure::UnsupportedNetwork(network) => ConnError::UnsupportedNetwork(network),
            DialFailure::Io(kind, msg) => ConnError::Io(io::Error::new(kind, msg)),
            DialFailure::Closed => ConnError::Closed,
        }
    }
}

/// A TCP connection whose dial is deferred until explicitly triggered.
///
/// Created unconnected. [`trigger_dial`](EventualConn::trigger_dial) runs
/// the supplied dial future on the runtime; reads and writes wait for it
/// to complete and then operate on the established stream. Cloning yields
/// another handle to the same connection.
#[derive(Clone)]
pub struct EventualConn {
    inner: Arc<Inner>,
}

struct Inner {
    timeout: Duration,
    dialed: AtomicBool,
    closed: AtomicBool,
    state: watch::Sender<DialState>,
    read_half: Mutex<Option<OwnedReadHalf>>,
    write_half: Mutex<Option<OwnedWriteHalf>>,
}

impl EventualConn {
    /// Create an unconnected connection.
    ///
    /// `timeout` bounds how long reads and writes wait for the dial to
    /// complete before giving up with [`ConnError::DialTimeout`].
    pub fn new(timeout: Duration) -> Self {
        let (state, _) = watch::channel(DialState::Pending);
        Self {
            inner: Arc::new(Inner {
                timeout,
                dialed: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                state,
                read_half: Mutex::new(None),
                write_half: Mutex::new(None),
            }),
        }
    }

    /// Start the dial in the background.
    ///
    /// The returned channel yields the dial outcome exactly once. A second
    /// trigger on the same connection reports [`ConnError::AlreadyDialed`]
    /// without running the supplied future.
    pub fn trigger_dial<F>(&self, dial: F) -> oneshot::Receiver<Result<(), ConnError>>
    where
        F: Future<Output = Result<TcpStream, ConnError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        if self.inner.dialed.swap(true, Ordering::SeqCst) {
            let _ = tx.send(Err(ConnError::AlreadyDialed));
            return rx;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            match dial.await {
                Ok(stream) => {
                    if inner.closed.load(Ordering::SeqCst) {
                        // Closed while dialing: the fresh stream is
                        // dropped, never stored.
                        let _ = tx.send(Err(ConnError::Closed));
                        return;
                    }
                    let (read, write) = stream.into_split();
                    *inner.read_half.lock().await = Some(read);
                    *inner.write_half.lock().await = Some(write);
                    // send_replace: the state must advance even when no
                    // read or write is parked on it yet.
                    inner.state.send_replace(DialState::Ready);
                    trace!("eventual connection ready");
                    let _ = tx.send(Ok(()));
                }
                Err(err) => {
                    inner
                        .state
                        .send_replace(DialState::Failed(DialFailure::from(&err)));
                    let _ = tx.send(Err(err));
                }
            }
        });

        rx
    }

    /// Read into `buf`, waiting for the dial to complete first.
    ///
    /// Concurrent reads serialize on the read half; reads and writes
    /// proceed independently of each other.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, ConnError> {
        self.await_ready().await?;
        let mut guard = self.inner.read_half.lock().await;
        let half = guard.as_mut().ok_or(ConnError::Closed)?;
        Ok(half.read(buf).await?)
    }

    /// Write the whole of `buf`, waiting for the dial to complete first.
    ///
    /// Reports `buf.len()` on success.
    pub async fn write_all(&self, buf: &[u8]) -> Result<usize, ConnError> {
        self.await_ready().await?;
        let mut guard = self.inner.write_half.lock().await;
        let half = guard.as_mut().ok_or(ConnError::Closed)?;
        half.write_all(buf).await?;
        Ok(buf.len())
    }

    /// Shut the connection down.
    ///
    /// Propagates the socket shutdown outcome. Idempotent: a second close
    /// is a no-op success. Reads and writes issued after close report
    /// [`ConnError::Closed`], as do waiters parked on a never-completed
    /// dial.
    pub async fn close(&self) -> Result<(), ConnError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.state.send_if_modified(|state| match state {
            DialState::Pending => {
                *state = DialState::Failed(DialFailure::Closed);
                true
            }
            _ => false,
        });

        self.inner.read_half.lock().await.take();
        match self.inner.write_half.lock().await.take() {
            Some(mut half) => {
                half.shutdown().await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Wait until the dial has resolved, bounded by the connection timeout.
    async fn await_ready(&self) -> Result<(), ConnError> {
        let mut rx = self.inner.state.subscribe();
        let wait = async {
            loop {
                let state = rx.borrow_and_update().clone();
                match state {
                    DialState::Ready => return Ok(()),
                    DialState::Failed(failure) => return Err(ConnError::from(failure)),
                    DialState::Pending => {}
                }
                if rx.changed().await.is_err() {
                    return Err(ConnError::Closed);
                }
            }
        };

        match tokio::time::timeout(self.inner.timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(ConnError::DialTimeout(self.inner.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    #[tokio::test]
    async fn read_waits_for_dial_to_land() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"ready").await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let conn = EventualConn::new(Duration::from_secs(2));
        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                let n = conn.read(&mut buf).await?;
                Ok::<_, ConnError>(buf[..n].to_vec())
            })
        };

        // Let the read park on the pending dial before triggering it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let done = conn
            .trigger_dial(async move { Ok(TcpStream::connect(addr).await?) });

        assert!(done.await.unwrap().is_ok());
        assert_eq!(reader.await.unwrap().unwrap(), b"ready");
    }

    #[tokio::test]
    async fn dial_failure_replays_to_waiters() {
        let conn = EventualConn::new(Duration::from_secs(1));
        let done = conn.trigger_dial(async {
            Err(ConnError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "refused",
            )))
        });
        assert!(matches!(done.await.unwrap(), Err(ConnError::Io(_))));

        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert!(
            matches!(&err, ConnError::Io(e) if e.kind() == io::ErrorKind::ConnectionRefused),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn waiters_are_bounded_by_the_timeout() {
        let conn = EventualConn::new(Duration::from_millis(50));
        let _done = conn.trigger_dial(async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(ConnError::Closed)
        });

        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, ConnError::DialTimeout(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn second_trigger_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let conn = EventualConn::new(Duration::from_secs(2));
        let first = conn.trigger_dial(async move { Ok(TcpStream::connect(addr).await?) });
        let second = conn.trigger_dial(async { Err(ConnError::Closed) });

        assert!(first.await.unwrap().is_ok());
        assert!(matches!(
            second.await.unwrap(),
            Err(ConnError::AlreadyDialed)
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_later_io() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let conn = EventualConn::new(Duration::from_secs(2));
        let done = conn.trigger_dial(async move { Ok(TcpStream::connect(addr).await?) });
        assert!(done.await.unwrap().is_ok());

        assert!(conn.close().await.is_ok());
        assert!(conn.close().await.is_ok());

        let mut buf = [0u8; 8];
        assert!(matches!(
            conn.read(&mut buf).await.unwrap_err(),
            ConnError::Closed
        ));
        assert!(matches!(
            conn.write_all(b"x").await.unwrap_err(),
            ConnError::Closed
        ));
    }

    #[tokio::test]
    async fn close_before_dial_unblocks_waiters_and_drops_late_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let conn = EventualConn::new(Duration::from_secs(2));
        assert!(conn.close().await.is_ok());

        let mut buf = [0u8; 8];
        assert!(matches!(
            conn.read(&mut buf).await.unwrap_err(),
            ConnError::Closed
        ));

        // A dial landing after close reports Closed instead of readiness.
        let done = conn.trigger_dial(async move { Ok(TcpStream::connect(addr).await?) });
        assert!(matches!(done.await.unwrap(), Err(ConnError::Closed)));
    }
}
