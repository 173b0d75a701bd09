//! Fault injection for testing reconnection and retransmission.
//!
//! Real connections die at awkward moments.  To exercise the client's
//! reconnect-and-resend path without depending on actual network trouble,
//! [`FaultyStream`] wraps any tokio stream and fails reads and writes at
//! random:
//!
//! | Fault        | Effect on the client                               |
//! |--------------|----------------------------------------------------|
//! | Read error   | An acknowledgement is lost; the request is resent. |
//! | Write error  | A request is lost; it is resent.                   |
//!
//! Faults are drawn from a seeded [`StdRng`], so a failing test replays the
//! same way every run.

use std::io;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::QueueError;
use crate::lock;
use crate::socket::SocketFactory;

/// Fault probabilities, each in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FaultConfig {
    /// Chance that a read fails instead of returning data.
    pub read_failure_rate: f64,
    /// Chance that a write fails instead of sending anything.
    pub write_failure_rate: f64,
}

impl FaultConfig {
    pub fn new(read_failure_rate: f64, write_failure_rate: f64) -> Self {
        Self {
            read_failure_rate,
            write_failure_rate,
        }
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        for (name, rate) in [
            ("read_failure_rate", self.read_failure_rate),
            ("write_failure_rate", self.write_failure_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(QueueError::InvalidArgument(format!(
                    "{name} must be within [0, 1]: {rate}"
                )));
            }
        }
        Ok(())
    }
}

fn injected(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, format!("injected {what} failure"))
}

/// A stream that fails reads and writes at random.
pub struct FaultyStream<S> {
    inner: S,
    config: FaultConfig,
    rng: StdRng,
}

impl<S> FaultyStream<S> {
    /// `config` must pass [`FaultConfig::validate`].
    pub fn new(inner: S, config: FaultConfig, seed: u64) -> Self {
        Self {
            inner,
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FaultyStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.rng.random_bool(this.config.read_failure_rate) {
            return Poll::Ready(Err(injected("read")));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FaultyStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.rng.random_bool(this.config.write_failure_rate) {
            return Poll::Ready(Err(injected("write")));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Wraps every stream another factory creates in a [`FaultyStream`].
pub struct FaultySocketFactory<F> {
    inner: F,
    config: FaultConfig,
    /// Seeds for successive streams.
    seeds: Mutex<StdRng>,
}

impl<F: SocketFactory> FaultySocketFactory<F> {
    pub fn new(inner: F, config: FaultConfig, seed: u64) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            inner,
            config,
            seeds: Mutex::new(StdRng::seed_from_u64(seed)),
        })
    }
}

impl<F: SocketFactory> SocketFactory for FaultySocketFactory<F> {
    type Stream = FaultyStream<F::Stream>;

    async fn create_socket(&self) -> io::Result<Self::Stream> {
        let stream = self.inner.create_socket().await?;
        let seed = lock(&self.seeds).random::<u64>();
        Ok(FaultyStream::new(stream, self.config, seed))
    }
}
