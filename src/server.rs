//! Accept loop and connection concurrency strategies.
//!
//! * `Sequential` runs each session inline; one client at a time.
//! * `Threaded` gives each session its own thread.
//! * `Pooled` hands each connection to a worker that owns it outright and
//!   shares nothing mutable with its siblings; the worker exits when its
//!   client leaves, the way a forked child would. An optional session limit
//!   turns excess clients away instead of leaving them queued.
//!
//! Every accepted control socket is registered together with its session's
//! transfers, so `ServerHandle::shutdown` can close both and wait for the
//! sessions to drain.

use anyhow::{bail, Context, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crate::data_channel::tune_socket;
use crate::logger::Logger;
use crate::session::ControlSession;
use crate::worker::TransferSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ServeMode {
    #[value(alias = "0")]
    Sequential,
    #[value(alias = "1")]
    Threaded,
    #[value(alias = "2")]
    Pooled,
}

impl fmt::Display for ServeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServeMode::Sequential => "sequential",
            ServeMode::Threaded => "threaded",
            ServeMode::Pooled => "pooled",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Directory served to clients and receiving uploads
    pub root: PathBuf,
    pub mode: ServeMode,
    /// Concurrent session cap in `Pooled` mode; `None` is unbounded
    pub max_sessions: Option<usize>,
}

impl ServerConfig {
    pub fn new(bind: SocketAddr, root: impl Into<PathBuf>, mode: ServeMode) -> Self {
        Self {
            bind,
            root: root.into(),
            mode,
            max_sessions: None,
        }
    }
}

/// An accepted client, owned by whichever strategy runs its session.
struct ConnectionRecord {
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    transfers: TransferSet,
}

struct Registered {
    control: Option<TcpStream>,
    transfers: TransferSet,
}

#[derive(Default)]
struct SessionRegistry {
    sessions: Mutex<HashMap<u64, Registered>>,
    idle: Condvar,
    next_id: AtomicU64,
}

impl SessionRegistry {
    fn register(&self, stream: &TcpStream, transfers: &TransferSet) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().insert(
            id,
            Registered {
                control: stream.try_clone().ok(),
                transfers: transfers.clone(),
            },
        );
        id
    }

    fn unregister(&self, id: u64) {
        let mut sessions = self.sessions.lock();
        sessions.remove(&id);
        if sessions.is_empty() {
            self.idle.notify_all();
        }
    }

    /// Close every control socket and cancel every transfer, live ones included.
    fn close_all(&self) {
        for session in self.sessions.lock().values() {
            session.transfers.close();
            if let Some(stream) = &session.control {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }

    fn active(&self) -> usize {
        self.sessions.lock().len()
    }

    fn wait_idle(&self) {
        let mut sessions = self.sessions.lock();
        while !sessions.is_empty() {
            self.idle.wait(&mut sessions);
        }
    }
}

/// State every session of one server needs.
struct Shared {
    root: PathBuf,
    logger: Arc<dyn Logger>,
    registry: SessionRegistry,
}

impl Shared {
    fn serve(&self, record: ConnectionRecord) {
        ControlSession::new(
            record.stream,
            record.peer,
            self.root.clone(),
            Arc::clone(&self.logger),
        )
        .with_transfers(record.transfers)
        .run();
        self.registry.unregister(record.id);
    }

    fn spawn_session(self: &Arc<Self>, name: String, record: ConnectionRecord) {
        let id = record.id;
        let shared = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(name)
            .spawn(move || shared.serve(record));
        if let Err(e) = spawned {
            // The record went down with the closure
            self.logger.error("spawn session", &e.to_string());
            self.registry.unregister(id);
        }
    }
}

pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    mode: ServeMode,
    max_sessions: Option<usize>,
    shared: Arc<Shared>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn bind(config: ServerConfig, logger: Arc<dyn Logger>) -> Result<Self> {
        if !config.root.is_dir() {
            bail!("Root path is not a directory: {}", config.root.display());
        }
        let root = std::fs::canonicalize(&config.root)
            .with_context(|| format!("Failed to canonicalize root path: {}", config.root.display()))?;
        let listener =
            TcpListener::bind(config.bind).with_context(|| format!("bind {}", config.bind))?;
        let local_addr = listener.local_addr().context("listener address")?;
        Ok(Self {
            listener,
            local_addr,
            mode: config.mode,
            max_sessions: config.max_sessions.map(|n| n.max(1)),
            shared: Arc::new(Shared {
                root,
                logger,
                registry: SessionRegistry::default(),
            }),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
            shutdown: Arc::clone(&self.shutdown),
            wake: loopback(self.local_addr),
        }
    }

    /// Accept connections until shut down, then close every session and
    /// wait for them to finish.
    pub fn run(self) -> Result<()> {
        let logger = Arc::clone(&self.shared.logger);
        let registry = &self.shared.registry;
        logger.server_started(self.local_addr, &self.mode.to_string());

        let mut worker_seq = 0u64;
        for conn in self.listener.incoming() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let stream = match conn {
                Ok(s) => s,
                Err(e) => {
                    logger.error("accept", &e.to_string());
                    continue;
                }
            };
            let peer = match stream.peer_addr() {
                Ok(p) => p,
                Err(e) => {
                    logger.error("peer address", &e.to_string());
                    continue;
                }
            };
            if self.mode == ServeMode::Pooled {
                if let Some(limit) = self.max_sessions {
                    if registry.active() >= limit {
                        logger.error(
                            "session limit",
                            &format!("{} sessions active, refusing {}", limit, peer),
                        );
                        let _ = stream.shutdown(Shutdown::Both);
                        continue;
                    }
                }
            }
            tune_socket(&stream);
            logger.session_opened(peer);

            let Some(record) = self.admit(stream, peer) else {
                break;
            };

            match self.mode {
                ServeMode::Sequential => self.shared.serve(record),
                ServeMode::Threaded => self.shared.spawn_session(format!("session-{}", peer), record),
                ServeMode::Pooled => {
                    worker_seq += 1;
                    self.shared
                        .spawn_session(format!("session-worker-{}", worker_seq), record);
                }
            }
        }

        registry.close_all();
        registry.wait_idle();
        logger.server_stopped();
        Ok(())
    }

    /// Register a connection before any session runs, so shutdown never
    /// misses one. Returns `None`, with the stream closed, when shutdown has
    /// started; its `close_all` may have run before this registration.
    fn admit(&self, stream: TcpStream, peer: SocketAddr) -> Option<ConnectionRecord> {
        let registry = &self.shared.registry;
        let transfers = TransferSet::new();
        let id = registry.register(&stream, &transfers);
        if self.shutdown.load(Ordering::SeqCst) {
            let _ = stream.shutdown(Shutdown::Both);
            registry.unregister(id);
            return None;
        }
        Some(ConnectionRecord {
            id,
            stream,
            peer,
            transfers,
        })
    }
}

fn loopback(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        ip if !ip.is_unspecified() => addr,
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port()),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port()),
    }
}

/// Remote control for a running `Server`.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
    shutdown: Arc<AtomicBool>,
    wake: SocketAddr,
}

impl ServerHandle {
    /// Stop accepting, close every control connection and data channel, and
    /// let `run` return once the sessions have drained.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.registry.close_all();
        // Unblock the accept loop
        let _ = TcpStream::connect(self.wake);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Sessions accepted and not yet finished.
    pub fn active_sessions(&self) -> usize {
        self.shared.registry.active()
    }
}
