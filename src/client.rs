use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{info, span, Instrument, Level};

use crate::config::TftpConfig;
use crate::error::TransferError;
use crate::file_store::FileStore;
use crate::packet::{Packet, MAX_BLOCK_NUMBER, MAX_DATA_LEN};
use crate::session::TransferSession;
use crate::transfer_socket::{CloseSignal, TransferSocket, UdpTransferSocket};

const TRANSFER_MODE: &str = "octet";

/// Runs single transfers against a server - or against a proxy standing in for the server, the
///  client cannot tell the difference.
///
/// Each transfer uses a fresh ephemeral socket, so its port is a new transfer ID.
pub struct TftpClient {
    config: Arc<TftpConfig>,
    target: SocketAddr,
    store: Arc<dyn FileStore>,
    close: CloseSignal,
}

impl TftpClient {
    pub fn new(config: Arc<TftpConfig>, target: SocketAddr, store: Arc<dyn FileStore>) -> TftpClient {
        TftpClient {
            config,
            target,
            store,
            close: CloseSignal::new(),
        }
    }

    /// raising this signal aborts a running transfer
    pub fn close_signal(&self) -> CloseSignal {
        self.close.clone()
    }

    /// sends the local file `local_name` to the server, storing it there as `remote_name`
    pub async fn upload(&self, local_name: &str, remote_name: &str) -> anyhow::Result<()> {
        let data = self.store.read_all(local_name).await
            .map_err(TransferError::from)?;
        if data.len() / MAX_DATA_LEN + 1 > MAX_BLOCK_NUMBER as usize {
            return Err(TransferError::FileTooLarge { max_blocks: MAX_BLOCK_NUMBER }.into());
        }

        let request = Packet::WriteRequest { filename: remote_name.to_string(), mode: TRANSFER_MODE.to_string() };
        let socket = self.open_socket().await?;
        let span = span!(Level::INFO, "session", side = "client", op = "put", file = %remote_name, peer = ?self.target);

        async {
            info!("uploading {} ({} bytes)", local_name, data.len());
            let mut session = TransferSession::open_request(self.config.session_config(), socket, self.target, request).await?;
            session.send_file(Bytes::from(data)).await?;
            info!("upload complete");
            Ok::<_, anyhow::Error>(())
        }.instrument(span).await
    }

    /// fetches `remote_name` from the server into the local file `local_name`. The local file
    ///  is created when the first block arrives, and it must not exist before.
    pub async fn download(&self, remote_name: &str, local_name: &str) -> anyhow::Result<()> {
        let request = Packet::ReadRequest { filename: remote_name.to_string(), mode: TRANSFER_MODE.to_string() };
        let socket = self.open_socket().await?;
        let span = span!(Level::INFO, "session", side = "client", op = "get", file = %remote_name, peer = ?self.target);

        async {
            info!("downloading to {}", local_name);
            let mut session = TransferSession::open_request(self.config.session_config(), socket, self.target, request).await?;
            session.receive_file(self.store.as_ref(), local_name, true).await?;
            info!("download complete");
            Ok::<_, anyhow::Error>(())
        }.instrument(span).await
    }

    async fn open_socket(&self) -> anyhow::Result<Arc<dyn TransferSocket>> {
        let ip = if self.target.is_ipv4() { Ipv4Addr::UNSPECIFIED.into() } else { Ipv6Addr::UNSPECIFIED.into() };
        let socket = UdpTransferSocket::bind(SocketAddr::new(ip, 0), self.close.subscribe()).await?;
        Ok(Arc::new(socket))
    }
}
