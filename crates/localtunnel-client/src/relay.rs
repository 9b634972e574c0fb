//! Relay connection
//!
//! One relay connection owns a socket to the rendezvous server and a socket to
//! the local service, and copies raw bytes between them in both directions.
//! Each direction runs as its own task; one direction ending does not end the
//! other.
//!
//! `relay` always emits exactly one [`RelayCompletion`], whether the connection
//! relayed, failed to establish, was stopped, or panicked.

use crate::config::ProxyConfig;
use crate::proxy::connect_via_proxy;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bytes read per copy iteration
pub const CHUNK_SIZE: usize = 4096;

/// Relay connection errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Copy direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    RemoteToLocal,
    LocalToRemote,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::RemoteToLocal => write!(f, "remote->local"),
            Direction::LocalToRemote => write!(f, "local->remote"),
        }
    }
}

/// A socket failure that ended one copy direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySocketError {
    pub direction: Direction,
    pub kind: io::ErrorKind,
    pub message: String,
}

impl fmt::Display for RelaySocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} copy failed: {}", self.direction, self.message)
    }
}

/// Lifecycle of a relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Establishing,
    Relaying,
    Closing,
    Closed,
}

impl RelayState {
    /// Whether sockets may be open in this state
    pub fn holds_sockets(self) -> bool {
        matches!(
            self,
            RelayState::Establishing | RelayState::Relaying | RelayState::Closing
        )
    }
}

/// Completion signal emitted once per `relay` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCompletion {
    pub id: usize,
    /// Both sockets were connected
    pub established: bool,
    pub bytes_remote_to_local: u64,
    pub bytes_local_to_remote: u64,
    /// Number of copy directions that ended with a socket error
    pub errors: usize,
}

impl RelayCompletion {
    fn new(id: usize) -> Self {
        Self {
            id,
            established: false,
            bytes_remote_to_local: 0,
            bytes_local_to_remote: 0,
            errors: 0,
        }
    }
}

/// Dialing targets for one relay connection
#[derive(Debug, Clone)]
pub struct RelayTarget {
    pub remote_host: String,
    pub remote_port: u16,
    pub local_host: String,
    pub local_port: u16,
    pub proxy: Option<ProxyConfig>,
    pub connect_timeout: Option<Duration>,
    /// Log contained failures
    pub debug: bool,
}

impl RelayTarget {
    pub fn new(remote_host: impl Into<String>, remote_port: u16, local_port: u16) -> Self {
        Self {
            remote_host: remote_host.into(),
            remote_port,
            local_host: "localhost".to_string(),
            local_port,
            proxy: None,
            connect_timeout: None,
            debug: false,
        }
    }

    pub fn with_local_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = host.into();
        self
    }

    pub fn with_proxy(mut self, proxy: Option<ProxyConfig>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn remote_address(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    pub fn local_address(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

/// Connect to `address`, optionally bounded by `timeout`
pub(crate) async fn dial(address: &str, timeout: Option<Duration>) -> Result<TcpStream, RelayError> {
    with_connect_timeout(timeout, address, async {
        TcpStream::connect(address)
            .await
            .map_err(|e| RelayError::Connect {
                target: address.to_string(),
                source: e,
            })
    })
    .await
}

async fn with_connect_timeout<T, F>(
    timeout: Option<Duration>,
    target: &str,
    connect: F,
) -> Result<T, RelayError>
where
    F: Future<Output = Result<T, RelayError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, connect)
            .await
            .map_err(|_| RelayError::ConnectTimeout(target.to_string()))?,
        None => connect.await,
    }
}

struct Inner {
    id: usize,
    target: RelayTarget,
    shutdown: CancellationToken,
    state: watch::Sender<RelayState>,
    error_log: Mutex<Vec<RelaySocketError>>,
    bytes_remote_to_local: AtomicU64,
    bytes_local_to_remote: AtomicU64,
}

impl Inner {
    fn counter(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::RemoteToLocal => &self.bytes_remote_to_local,
            Direction::LocalToRemote => &self.bytes_local_to_remote,
        }
    }

    fn record_error(&self, error: RelaySocketError) {
        self.error_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error);
    }

    fn set_state(&self, state: RelayState) {
        self.state.send_replace(state);
    }
}

/// How a copy direction ended
enum CopyEnd {
    PeerClosed,
    Stopped,
}

/// One pool slot: a remote socket, a local socket and the copy loops between them
#[derive(Clone)]
pub struct RelayConnection {
    inner: Arc<Inner>,
}

impl RelayConnection {
    pub fn new(id: usize, target: RelayTarget) -> Self {
        let (state, _) = watch::channel(RelayState::Idle);
        Self {
            inner: Arc::new(Inner {
                id,
                target,
                shutdown: CancellationToken::new(),
                state,
                error_log: Mutex::new(Vec::new()),
                bytes_remote_to_local: AtomicU64::new(0),
                bytes_local_to_remote: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn target(&self) -> &RelayTarget {
        &self.inner.target
    }

    pub fn state(&self) -> RelayState {
        *self.inner.state.borrow()
    }

    /// Copy failures observed during the current (or last) relay attempt
    pub fn error_log(&self) -> Vec<RelaySocketError> {
        self.inner
            .error_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Relay until both directions finish or `stop` is called.
    ///
    /// Emits exactly one value on `completion` when done. A slot is reserved
    /// before anything else, so a full channel delays the start of the relay
    /// rather than dropping the report.
    pub async fn relay(&self, completion: mpsc::Sender<RelayCompletion>) {
        let inner = self.inner.clone();
        let id = inner.id;

        let permit = completion.reserve_owned().await.ok();
        let mut report = scopeguard::guard(RelayCompletion::new(id), move |report| {
            match permit {
                Some(permit) => {
                    permit.send(report);
                }
                None => {
                    debug!("Relay connection {} completed after the pool stopped waiting", id);
                }
            }
        });
        // Declared after `report`, so it runs first: Closed is visible before the
        // completion is sent.
        let _closed = scopeguard::guard(inner.clone(), |inner| {
            inner.set_state(RelayState::Closed)
        });

        inner
            .error_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        inner.bytes_remote_to_local.store(0, Ordering::SeqCst);
        inner.bytes_local_to_remote.store(0, Ordering::SeqCst);

        if inner.shutdown.is_cancelled() {
            debug!("Relay connection {} stopped before starting", id);
            return;
        }

        inner.set_state(RelayState::Establishing);

        let established = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => {
                debug!("Relay connection {} stopped while establishing", id);
                return;
            }
            result = self.establish() => result,
        };

        let (remote, local, pending) = match established {
            Ok(sockets) => sockets,
            Err(e) => {
                if inner.target.debug {
                    debug!("Relay connection {} failed to establish: {}", id, e);
                }
                return;
            }
        };

        report.established = true;
        inner.set_state(RelayState::Relaying);
        debug!(
            "Relay connection {} relaying {} <-> {}",
            id,
            inner.target.remote_address(),
            inner.target.local_address()
        );

        let (remote_read, remote_write) = remote.into_split();
        let (local_read, local_write) = local.into_split();

        let remote_to_local = tokio::spawn(copy_loop(
            inner.clone(),
            Direction::RemoteToLocal,
            remote_read,
            local_write,
            pending,
        ));
        let local_to_remote = tokio::spawn(copy_loop(
            inner.clone(),
            Direction::LocalToRemote,
            local_read,
            remote_write,
            Vec::new(),
        ));

        let (a, b) = tokio::join!(remote_to_local, local_to_remote);
        for result in [a, b] {
            if let Err(e) = result {
                warn!("Relay connection {} copy task failed: {}", id, e);
            }
        }

        // Both copy tasks have dropped their socket halves.
        inner.set_state(RelayState::Closing);

        report.bytes_remote_to_local = inner.bytes_remote_to_local.load(Ordering::SeqCst);
        report.bytes_local_to_remote = inner.bytes_local_to_remote.load(Ordering::SeqCst);
        report.errors = self.error_log().len();

        debug!(
            "Relay connection {} finished: {} bytes in, {} bytes out, {} errors",
            id, report.bytes_remote_to_local, report.bytes_local_to_remote, report.errors
        );
    }

    /// Close both sockets and wait until they are released. Idempotent.
    pub async fn stop(&self) {
        self.request_stop();
        self.closed().await;
    }

    /// Signal the copy loops (or a pending dial) to give up their sockets
    pub fn request_stop(&self) {
        self.inner.shutdown.cancel();
    }

    /// Wait until no socket is held
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| !s.holds_sockets()).await;
    }

    async fn establish(&self) -> Result<(TcpStream, TcpStream, Vec<u8>), RelayError> {
        let target = &self.inner.target;

        let (remote, pending) = match &target.proxy {
            Some(proxy) => {
                debug!(
                    "Connecting to {} via proxy {}",
                    target.remote_address(),
                    proxy.address()
                );
                with_connect_timeout(
                    target.connect_timeout,
                    &target.remote_address(),
                    connect_via_proxy(proxy, &target.remote_host, target.remote_port),
                )
                .await?
            }
            None => (
                dial(&target.remote_address(), target.connect_timeout).await?,
                Vec::new(),
            ),
        };

        let local = dial(&target.local_address(), target.connect_timeout).await?;

        Ok((remote, local, pending))
    }
}

async fn copy_loop<R, W>(
    inner: Arc<Inner>,
    direction: Direction,
    mut source: R,
    mut destination: W,
    pending: Vec<u8>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = copy_until_closed(&inner, direction, &mut source, &mut destination, pending).await;

    match result {
        Ok(CopyEnd::PeerClosed) => {
            debug!("Relay connection {} {} reached EOF", inner.id, direction);
            // Half-close so the peer sees EOF; the other direction keeps running.
            if let Err(e) = destination.shutdown().await {
                debug!(
                    "Relay connection {} {} shutdown failed: {}",
                    inner.id, direction, e
                );
            }
        }
        Ok(CopyEnd::Stopped) => {
            debug!("Relay connection {} {} stopped", inner.id, direction);
        }
        Err(e) => {
            if inner.target.debug {
                debug!("Relay connection {} {} failed: {}", inner.id, direction, e);
            }
            inner.record_error(RelaySocketError {
                direction,
                kind: e.kind(),
                message: e.to_string(),
            });
        }
    }
}

async fn copy_until_closed<R, W>(
    inner: &Inner,
    direction: Direction,
    source: &mut R,
    destination: &mut W,
    pending: Vec<u8>,
) -> io::Result<CopyEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let counter = inner.counter(direction);

    if !pending.is_empty() {
        destination.write_all(&pending).await?;
        counter.fetch_add(pending.len() as u64, Ordering::SeqCst);
    }

    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let n = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => return Ok(CopyEnd::Stopped),
            read = source.read(&mut buffer) => read?,
        };

        if n == 0 {
            return Ok(CopyEnd::PeerClosed);
        }

        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => return Ok(CopyEnd::Stopped),
            written = destination.write_all(&buffer[..n]) => written?,
        }
        counter.fetch_add(n as u64, Ordering::SeqCst);
    }
}
