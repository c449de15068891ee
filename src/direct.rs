//! Direct connection with live interference detection.
//!
//! A [`DirectConn`] dials its destination directly and grades every dial
//! and read against a [`Detector`], maintaining a per-connection "should
//! this traffic detour?" flag that a higher-level selector polls to switch
//! transports. The flag starts pessimistic and is cleared only after a
//! clean read; any poisoning, tampering, or fake-response signal puts it
//! back.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::detect::Detector;
use crate::error::ConnError;
use crate::eventual::EventualConn;

/// Default limit on the dial and on reads/writes waiting for it.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of an asynchronous read or write.
///
/// The buffer handed to [`DirectConn::read`] or [`DirectConn::write`]
/// travels with the result so the caller gets it back. On any error the
/// reported count is zero: partial reads are not exposed when
/// interference was detected.
#[derive(Debug)]
pub struct IoOutcome {
    pub buf: Vec<u8>,
    pub result: Result<usize, ConnError>,
}

/// A directly-dialed connection that evaluates itself for interference.
///
/// `dial`, `read`, and `write` never block the caller: each returns a
/// one-shot channel and performs the work on a spawned task; awaiting the
/// channel is the only suspension point. [`should_detour`](Self::should_detour)
/// may be called at any time, including while operations are in flight.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct DirectConn {
    inner: Arc<Inner>,
}

struct Inner {
    network: String,
    addr: String,
    conn: EventualConn,
    detector: Arc<dyn Detector>,
    dial_timeout: Duration,
    read_first: AtomicBool,
    should_detour: AtomicBool,
}

impl DirectConn {
    /// Create a connection to `addr` on `network` (only `"tcp"` dials).
    pub fn new(
        network: impl Into<String>,
        addr: impl Into<String>,
        detector: Arc<dyn Detector>,
    ) -> Self {
        Self::with_dial_timeout(network, addr, detector, DEFAULT_DIAL_TIMEOUT)
    }

    /// Create a connection with a specific dial timeout.
    ///
    /// The same timeout bounds the dial itself and how long reads and
    /// writes wait for it to complete.
    pub fn with_dial_timeout(
        network: impl Into<String>,
        addr: impl Into<String>,
        detector: Arc<dyn Detector>,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                network: network.into(),
                addr: addr.into(),
                conn: EventualConn::new(dial_timeout),
                detector,
                dial_timeout,
                read_first: AtomicBool::new(false),
                // Pessimistic until a clean dial + read cycle is observed.
                should_detour: AtomicBool::new(true),
            }),
        }
    }

    /// The dial target address.
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Trigger the background dial.
    ///
    /// The returned channel yields once: `Ok(())` for an established,
    /// unpoisoned connection, or the dial error. A dial that establishes
    /// TCP but lands on a poisoned address is reported as
    /// [`ConnError::DnsHijacked`] and the socket is shut down.
    pub fn dial(&self) -> oneshot::Receiver<Result<(), ConnError>> {
        let inner = self.inner.clone();
        self.inner
            .conn
            .trigger_dial(async move { inner.dial_direct().await })
    }

    /// Issue an asynchronous read into `buf`.
    ///
    /// The first read ever issued on the connection runs the first-read
    /// checker; every later read runs the follow-up checker. While the
    /// read is in flight the connection reports itself detour-worthy;
    /// only a clean checker outcome clears the flag.
    pub fn read(&self, mut buf: Vec<u8>) -> oneshot::Receiver<IoOutcome> {
        trace!(addr = %self.inner.addr, "direct read issued");
        let first = self
            .inner
            .read_first
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        let (tx, rx) = oneshot::channel();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            // Assume the worst while the read is in flight; cleared below
            // only once the checker passes.
            inner.set_should_detour(true);
            let result = inner.checked_read(&mut buf, first).await;
            if result.is_ok() {
                inner.set_should_detour(false);
            }
            let _ = tx.send(IoOutcome { buf, result });
        });
        rx
    }

    /// Issue an asynchronous write of the whole buffer.
    ///
    /// Writes carry no detection signal: the detector is not consulted and
    /// the detour flag is left alone.
    pub fn write(&self, buf: Vec<u8>) -> oneshot::Receiver<IoOutcome> {
        let (tx, rx) = oneshot::channel();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = inner.conn.write_all(&buf).await;
            let _ = tx.send(IoOutcome { buf, result });
        });
        rx
    }

    /// Close the underlying connection, propagating its outcome.
    pub async fn close(&self) -> Result<(), ConnError> {
        self.inner.conn.close().await
    }

    /// Whether traffic to this destination should take the detour path.
    ///
    /// Non-blocking; reflects the most recent update from the dial and
    /// read paths. During an in-flight read this reads conservatively
    /// `true`.
    pub fn should_detour(&self) -> bool {
        self.inner.should_detour.load(Ordering::SeqCst)
    }
}

impl Inner {
    /// Dial function handed to the eventual connection.
    async fn dial_direct(&self) -> Result<TcpStream, ConnError> {
        if self.network != "tcp" {
            return Err(ConnError::UnsupportedNetwork(self.network.clone()));
        }

        let dialed = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&self.addr)).await;
        let stream = match dialed {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(self.inspect_dial_error(err.into())),
            Err(_) => return Err(self.inspect_dial_error(ConnError::DialTimeout(self.dial_timeout))),
        };

        if self.detector.dns_poisoned(&stream) {
            self.shutdown_poisoned(stream).await;
            debug!(addr = %self.addr, "dial directly, dns hijacked");
            return Err(ConnError::DnsHijacked);
        }

        trace!(addr = %self.addr, "dial directly succeeded");
        Ok(stream)
    }

    /// Tampering suspicion on a failed dial is diagnostic only: it is
    /// logged and the error propagates unchanged. The detour flag moves
    /// on reads, not on dial failures.
    fn inspect_dial_error(&self, err: ConnError) -> ConnError {
        if self.detector.tampering_suspected(&err) {
            debug!(addr = %self.addr, error = %err, "dial directly, tampering suspected");
        } else {
            debug!(addr = %self.addr, error = %err, "dial directly failed");
        }
        err
    }

    /// The poisoning determination wins over any close outcome: shutdown
    /// errors are logged, never propagated.
    async fn shutdown_poisoned(&self, mut stream: TcpStream) {
        if let Err(err) = stream.shutdown().await {
            debug!(addr = %self.addr, error = %err, "error closing poisoned connection");
        }
    }

    async fn checked_read(&self, buf: &mut [u8], first: bool) -> Result<usize, ConnError> {
        let outcome = self.conn.read(buf).await;
        if first {
            self.check_first_read(buf, outcome)
        } else {
            self.check_followup_read(buf, outcome)
        }
    }

    fn check_first_read(
        &self,
        buf: &[u8],
        outcome: Result<usize, ConnError>,
    ) -> Result<usize, ConnError> {
        match outcome {
            Err(err) => {
                debug!(addr = %self.addr, error = %err, "error on first direct read");
                if self.detector.tampering_suspected(&err) {
                    self.set_should_detour(true);
                }
                Err(err)
            }
            Ok(n) => {
                if self.detector.fake_response(&buf[..n]) {
                    debug!(addr = %self.addr, bytes = n, "first direct read is hijacked");
                    self.set_should_detour(true);
                    return Err(ConnError::ResponseHijacked);
                }
                trace!(addr = %self.addr, bytes = n, "first direct read");
                Ok(n)
            }
        }
    }

    fn check_followup_read(
        &self,
        buf: &[u8],
        outcome: Result<usize, ConnError>,
    ) -> Result<usize, ConnError> {
        match outcome {
            Err(err) => {
                debug!(addr = %self.addr, error = %err, "error on follow-up direct read");
                if self.detector.tampering_suspected(&err) {
                    debug!(addr = %self.addr, "still blocked, should detour next time");
                    self.set_should_detour(true);
                }
                Err(err)
            }
            Ok(n) => {
                if self.detector.fake_response(&buf[..n]) {
                    debug!(addr = %self.addr, "still content hijacked, should detour next time");
                    self.set_should_detour(true);
                    return Err(ConnError::ResponseHijacked);
                }
                trace!(addr = %self.addr, bytes = n, "follow-up direct read");
                Ok(n)
            }
        }
    }

    fn set_should_detour(&self, should: bool) {
        trace!(addr = %self.addr, should, "detour flag updated");
        self.should_detour.store(should, Ordering::SeqCst);
    }
}
