use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, span, warn, Instrument, Level};

use crate::config::TftpConfig;
use crate::error::TransferError;
use crate::file_store::FileStore;
use crate::packet::{ErrorCode, Packet};
use crate::session::{Role, TransferSession};
use crate::transfer_socket::{CloseSignal, Received, TransferSocket, UdpTransferSocket};

/// An entry in the server's registry of running sessions, keyed by the client's endpoint
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ActiveSession {
    /// the session's own (ephemeral) endpoint, i.e. the server side's transfer ID
    pub local_addr: SocketAddr,
    pub file_name: String,
    pub role: Role,
}

type Registry = Arc<Mutex<FxHashMap<SocketAddr, ActiveSession>>>;

/// Modes accepted in requests. Both are transferred byte for byte.
const SUPPORTED_MODES: [&str; 2] = ["octet", "netascii"];

pub fn is_supported_mode(mode: &str) -> bool {
    SUPPORTED_MODES.iter().any(|m| m.eq_ignore_ascii_case(mode))
}

/// Listens for requests on the well-known port and runs each accepted request as a
///  [TransferSession] on its own task and its own ephemeral port.
pub struct ServerDispatcher {
    config: Arc<TftpConfig>,
    store: Arc<dyn FileStore>,
    socket: UdpTransferSocket,
    registry: Registry,
    /// closes the well-known socket, ending the dispatch loop
    accept_signal: CloseSignal,
    /// closes all session sockets
    session_signal: CloseSignal,
    sessions: JoinSet<()>,
}

/// Controls a running [ServerDispatcher]
pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: Registry,
    accept_signal: CloseSignal,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn active_sessions(&self) -> FxHashMap<SocketAddr, ActiveSession> {
        self.registry.lock().await.clone()
    }

    /// Stops accepting requests and waits for running sessions to finish, closing them when
    ///  the configured grace period expires
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.accept_signal.close();
        self.task.await?;
        Ok(())
    }
}

impl ServerDispatcher {
    pub async fn bind(config: Arc<TftpConfig>, store: Arc<dyn FileStore>) -> anyhow::Result<ServerDispatcher> {
        config.validate()?;

        let accept_signal = CloseSignal::new();
        let socket = UdpTransferSocket::bind(config.server_addr, accept_signal.subscribe()).await?;
        info!("server listening on {:?}", socket.local_addr());

        Ok(ServerDispatcher {
            config,
            store,
            socket,
            registry: Default::default(),
            accept_signal,
            session_signal: CloseSignal::new(),
            sessions: JoinSet::new(),
        })
    }

    /// binds the well-known port and runs the dispatch loop on a separate task
    pub async fn start(config: Arc<TftpConfig>, store: Arc<dyn FileStore>) -> anyhow::Result<ServerHandle> {
        let server = Self::bind(config, store).await?;
        let local_addr = server.socket.local_addr();
        let registry = server.registry.clone();
        let accept_signal = server.accept_signal.clone();

        Ok(ServerHandle {
            local_addr,
            registry,
            accept_signal,
            task: tokio::spawn(server.run()),
        })
    }

    pub async fn run(mut self) {
        loop {
            while self.sessions.try_join_next().is_some() {}

            match self.socket.recv_datagram(self.config.timeout).await {
                Received::Datagram { from, buf } => self.on_datagram(from, &buf).await,
                Received::Timeout => {}
                Received::Closed => break,
            }
        }
        self.shutdown_sessions().await;
    }

    async fn shutdown_sessions(mut self) {
        let grace_period = self.config.shutdown_grace_period;
        info!("server shutting down, waiting up to {:?} for {} running sessions", grace_period, self.sessions.len());

        let sessions = &mut self.sessions;
        let all_done = async move { while sessions.join_next().await.is_some() {} };
        if timeout(grace_period, all_done).await.is_err() {
            warn!("grace period expired - closing {} remaining sessions", self.sessions.len());
            self.session_signal.close();
            while self.sessions.join_next().await.is_some() {}
        }
        info!("server shut down");
    }

    async fn on_datagram(&mut self, from: SocketAddr, buf: &[u8]) {
        let packet = match Packet::decode(buf) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("discarding malformed datagram from {:?}: {}", from, e);
                return;
            }
        };

        let (file_name, mode, role) = match packet {
            Packet::ReadRequest { filename, mode } => (filename, mode, Role::Sender),
            Packet::WriteRequest { filename, mode } => (filename, mode, Role::Receiver),
            other => {
                warn!("received {:?} from {:?} on the request port - rejecting", other, from);
                self.reply_error(from, ErrorCode::IllegalOperation, format!("illegal operation: {:?} is not a request", other)).await;
                return;
            }
        };

        if !is_supported_mode(&mode) {
            warn!("request for {} from {:?} has unsupported mode {:?} - rejecting", file_name, from, mode);
            self.reply_error(from, ErrorCode::IllegalOperation, format!("illegal operation: unsupported mode {}", mode)).await;
            return;
        }

        let mut registry = self.registry.lock().await;
        if registry.contains_key(&from) {
            debug!("ignoring retransmitted request for {} from {:?} - session is running", file_name, from);
            return;
        }

        let socket = match UdpTransferSocket::bind_ephemeral(self.socket.local_addr(), self.session_signal.subscribe()).await {
            Ok(socket) => socket,
            Err(e) => {
                error!("cannot bind session socket for request from {:?}: {}", from, e);
                return;
            }
        };
        let socket: Arc<dyn TransferSocket> = Arc::new(socket);

        registry.insert(from, ActiveSession {
            local_addr: socket.local_addr(),
            file_name: file_name.clone(),
            role,
        });
        drop(registry);

        let session = TransferSession::accepted(self.config.session_config(), socket, from);
        let store = self.store.clone();
        let registry = self.registry.clone();
        let span = span!(Level::INFO, "session", side = "server", role = ?role, file = %file_name, peer = ?from);

        self.sessions.spawn(async move {
            info!("starting transfer");
            let result = match role {
                Role::Sender => serve_read(session, store.as_ref(), &file_name).await,
                Role::Receiver => serve_write(session, store.as_ref(), &file_name).await,
            };
            match result {
                Ok(()) => info!("transfer complete"),
                Err(e) => warn!("transfer failed: {}", e),
            }
            registry.lock().await.remove(&from);
        }.instrument(span));
    }

    async fn reply_error(&self, to: SocketAddr, code: ErrorCode, message: String) {
        match Packet::error(code, message).encode() {
            Ok(buf) => self.socket.send_datagram(to, &buf).await,
            Err(e) => error!("cannot encode error reply: {}", e),
        }
    }
}

async fn serve_read(mut session: TransferSession, store: &dyn FileStore, file_name: &str) -> Result<(), TransferError> {
    match store.read_all(file_name).await {
        Ok(data) => session.send_file(Bytes::from(data)).await,
        Err(e) => Err(session.reject(e).await),
    }
}

async fn serve_write(mut session: TransferSession, store: &dyn FileStore, file_name: &str) -> Result<(), TransferError> {
    if let Err(e) = store.create(file_name).await {
        return Err(session.reject(e).await);
    }
    session.receive_file(store, file_name, false).await
}
