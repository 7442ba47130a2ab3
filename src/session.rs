//! The reliable-delivery engine shared by client and server.
//!
//! A [TransferSession] moves one file in one direction, with exactly one packet in flight at any
//!  time. Whether it acts as the sender (DATA out, ACKs in) or the receiver (DATA in, ACKs out)
//!  depends on which of [TransferSession::send_file] and [TransferSession::receive_file] is
//!  called, and the per-exchange handling is identical in both roles:
//!
//! * malformed datagrams are discarded without a reply and without affecting the retry budget
//! * the first valid datagram binds the peer's transfer ID (address and port) unless it is known
//!    already; datagrams from any other source get an 'unknown transfer ID' error reply and are
//!    otherwise ignored
//! * an ERROR packet from the peer ends the session immediately
//! * a packet of the wrong type or with a block number from the future is a protocol violation:
//!    the peer gets an 'illegal operation' error and the session ends
//! * a block number from the past is a duplicate: duplicate DATA is re-acknowledged, duplicate
//!    ACKs are dropped
//! * if no matching packet arrives in time, the last packet is sent again, until the retry
//!    budget is exhausted

use std::cmp::Ordering;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::config::SessionConfig;
use crate::error::TransferError;
use crate::file_store::{FileStore, FileStoreError};
use crate::packet::{ErrorCode, Opcode, Packet, MAX_BLOCK_NUMBER, MAX_DATA_LEN};
use crate::transfer_socket::{Received, TransferSocket};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    Init,
    AwaitAck,
    AwaitData,
    Complete,
    Errored,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    Sender,
    Receiver,
}

#[derive(Copy, Clone)]
enum Expect {
    Ack(u16),
    Data(u16),
}
impl Expect {
    fn block(self) -> u16 {
        match self {
            Expect::Ack(block) | Expect::Data(block) => block,
        }
    }

    fn opcode(self) -> Opcode {
        match self {
            Expect::Ack(_) => Opcode::Ack,
            Expect::Data(_) => Opcode::Data,
        }
    }
}
impl Debug for Expect {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Expect::Ack(block) => write!(f, "ACK({})", block),
            Expect::Data(block) => write!(f, "DATA({})", block),
        }
    }
}

/// Cuts a file into DATA payloads. The last payload is always shorter than [MAX_DATA_LEN] since
///  that is what signals the end of the transfer - if the file length is a multiple of the
///  block size, that means an additional empty payload.
pub fn split_into_blocks(data: &Bytes) -> Vec<Bytes> {
    let mut result = Vec::with_capacity(data.len() / MAX_DATA_LEN + 1);
    let mut offs = 0;
    while data.len() - offs >= MAX_DATA_LEN {
        result.push(data.slice(offs..offs + MAX_DATA_LEN));
        offs += MAX_DATA_LEN;
    }
    result.push(data.slice(offs..));
    result
}

/// One side of a single file transfer, bound to its own socket
pub struct TransferSession {
    config: SessionConfig,
    socket: Arc<dyn TransferSocket>,
    role: Option<Role>,
    state: SessionState,
    /// the block number that is currently expected (receiver) or in flight (sender)
    block: u16,
    /// the peer's transfer ID - once set, it never changes
    peer: Option<SocketAddr>,
    /// where the request went, for re-sending it while the peer is still unknown
    request_dest: Option<SocketAddr>,
    retries_left: u32,
    last_sent: Option<Packet>,
    deadline: Instant,
}

impl TransferSession {
    /// Server side: the request was received from `peer`, and its source is the peer's transfer
    ///  ID. `socket` is a fresh socket whose port becomes this side's transfer ID.
    pub fn accepted(config: SessionConfig, socket: Arc<dyn TransferSocket>, peer: SocketAddr) -> TransferSession {
        Self::new(config, socket, Some(peer), None)
    }

    /// Client side: sends `request` to the server's well-known address. The peer's transfer ID
    ///  is learned from the first reply.
    pub async fn open_request(config: SessionConfig, socket: Arc<dyn TransferSocket>, server_addr: SocketAddr, request: Packet) -> Result<TransferSession, TransferError> {
        let mut session = Self::new(config, socket, None, Some(server_addr));
        debug!("sending {:?} to {:?}", request, server_addr);
        session.send_to_peer(request).await?;
        Ok(session)
    }

    fn new(config: SessionConfig, socket: Arc<dyn TransferSocket>, peer: Option<SocketAddr>, request_dest: Option<SocketAddr>) -> TransferSession {
        TransferSession {
            config,
            socket,
            role: None,
            state: SessionState::Init,
            block: 0,
            peer,
            request_dest,
            retries_left: config.max_retries,
            last_sent: None,
            deadline: Instant::now() + config.timeout,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Sender role: transfers `data` block by block, waiting for each block's ACK before sending
    ///  the next one. If the session was opened by a write request, the server's ACK for block 0
    ///  is awaited first.
    pub async fn send_file(&mut self, data: Bytes) -> Result<(), TransferError> {
        self.role = Some(Role::Sender);
        let result = self.do_send_file(data).await;
        self.finish(result)
    }

    /// Receiver role: appends the payload of each accepted DATA block to `file_name` in `store`,
    ///  acknowledging it after it was written. If the session was accepted from a write request,
    ///  it starts by acknowledging block 0.
    ///
    /// With `create_on_first_block`, the file is created when the first block arrives (rather
    ///  than up front by the caller) so that a rejected request leaves no file behind.
    pub async fn receive_file(&mut self, store: &dyn FileStore, file_name: &str, create_on_first_block: bool) -> Result<(), TransferError> {
        self.role = Some(Role::Receiver);
        let result = self.do_receive_file(store, file_name, create_on_first_block).await;
        self.finish(result)
    }

    /// Ends the session before any transfer took place because the file could not be opened,
    ///  telling the peer why.
    pub async fn reject(&mut self, e: FileStoreError) -> TransferError {
        let e = self.file_error(e).await;
        self.state = SessionState::Errored;
        e
    }

    fn finish(&mut self, result: Result<(), TransferError>) -> Result<(), TransferError> {
        match &result {
            Ok(()) => {
                debug!("transfer complete after block {}", self.block);
                self.state = SessionState::Complete;
            }
            Err(e) => {
                debug!("transfer failed in state {:?}: {}", self.state, e);
                self.state = SessionState::Errored;
            }
        }
        result
    }

    async fn do_send_file(&mut self, data: Bytes) -> Result<(), TransferError> {
        let blocks = split_into_blocks(&data);
        if blocks.len() > MAX_BLOCK_NUMBER as usize {
            warn!("file of {} bytes needs {} blocks, maximum is {}", data.len(), blocks.len(), MAX_BLOCK_NUMBER);
            if let Some(peer) = self.peer {
                self.send_packet(peer, &Packet::error(ErrorCode::NotDefined, "file too large")).await;
            }
            return Err(TransferError::FileTooLarge { max_blocks: MAX_BLOCK_NUMBER });
        }

        if self.peer.is_none() {
            // our write request is in flight, and the reply's source becomes the peer
            self.state = SessionState::AwaitAck;
            self.await_packet(Expect::Ack(0)).await?;
        }

        for (block, payload) in (1..=MAX_BLOCK_NUMBER).zip(blocks) {
            self.block = block;
            trace!("sending block {} with {} bytes", block, payload.len());
            self.send_to_peer(Packet::Data { block, payload }).await?;

            self.state = SessionState::AwaitAck;
            self.await_packet(Expect::Ack(block)).await?;
        }
        Ok(())
    }

    async fn do_receive_file(&mut self, store: &dyn FileStore, file_name: &str, create_on_first_block: bool) -> Result<(), TransferError> {
        if self.last_sent.is_none() {
            // accepted write request: block 0 acknowledges the request itself
            self.send_to_peer(Packet::ack(0)).await?;
        }

        let mut block = 1u16;
        loop {
            self.block = block;
            self.state = SessionState::AwaitData;
            let payload = match self.await_packet(Expect::Data(block)).await? {
                Packet::Data { payload, .. } => payload,
                other => return Err(TransferError::ProtocolViolation(format!("expected DATA, got {:?}", other))),
            };

            if block == 1 && create_on_first_block {
                if let Err(e) = store.create(file_name).await {
                    return Err(self.file_error(e).await);
                }
            }
            if let Err(e) = store.append(file_name, &payload).await {
                return Err(self.file_error(e).await);
            }
            trace!("wrote block {} with {} bytes to {}", block, payload.len(), file_name);

            self.send_to_peer(Packet::ack(block)).await?;

            if payload.len() < MAX_DATA_LEN {
                return Ok(());
            }
            if block == MAX_BLOCK_NUMBER {
                warn!("sender exceeds the maximum of {} blocks", MAX_BLOCK_NUMBER);
                if let Some(peer) = self.peer {
                    self.send_packet(peer, &Packet::error(ErrorCode::NotDefined, "file too large")).await;
                }
                return Err(TransferError::FileTooLarge { max_blocks: MAX_BLOCK_NUMBER });
            }
            block += 1;
        }
    }

    /// Waits for the packet that matches `expect`, handling everything else that arrives in the
    ///  meantime, and re-sending the last packet on timeout.
    async fn await_packet(&mut self, expect: Expect) -> Result<Packet, TransferError> {
        loop {
            let timeout = self.deadline.saturating_duration_since(Instant::now());
            let (from, buf) = match self.socket.recv_datagram(timeout).await {
                Received::Datagram { from, buf } => (from, buf),
                Received::Timeout => {
                    self.on_timeout(expect).await?;
                    continue;
                }
                Received::Closed => {
                    debug!("socket closed while waiting for {:?}", expect);
                    return Err(TransferError::SocketClosed);
                }
            };

            let packet = match Packet::decode(&buf) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("discarding malformed datagram from {:?}: {}", from, e);
                    continue;
                }
            };
            trace!("received {:?} from {:?}", packet, from);

            match self.peer {
                None => {
                    debug!("bound transfer to peer {:?}", from);
                    self.peer = Some(from);
                }
                Some(peer) if peer != from => {
                    warn!("received {:?} from unknown transfer ID {:?}, bound to {:?} - rejecting", packet, from, peer);
                    self.send_packet(from, &Packet::error(ErrorCode::UnknownTransferId, "unknown transfer ID")).await;
                    continue;
                }
                Some(_) => {}
            }

            if let Packet::Error { code, message } = &packet {
                warn!("peer aborted the transfer with error {:?}: {}", code, message);
                return Err(TransferError::RemoteError { code: *code, message: message.clone() });
            }

            if packet.opcode() != expect.opcode() {
                return Err(self.violation(format!("expected {:?}, received {:?}", expect, packet)).await);
            }

            let block = packet.block().unwrap_or_default();
            match block.cmp(&expect.block()) {
                Ordering::Equal => {
                    self.retries_left = self.config.max_retries;
                    return Ok(packet);
                }
                Ordering::Less => {
                    if expect.opcode() == Opcode::Data {
                        debug!("duplicate DATA block {} while waiting for {:?} - re-sending its ACK", block, expect);
                        if let Some(peer) = self.peer {
                            self.send_packet(peer, &Packet::ack(block)).await;
                        }
                    }
                    else {
                        debug!("duplicate ACK {} while waiting for {:?} - ignoring", block, expect);
                    }
                }
                Ordering::Greater => {
                    return Err(self.violation(format!("expected {:?}, received {:?}", expect, packet)).await);
                }
            }
        }
    }

    async fn on_timeout(&mut self, expect: Expect) -> Result<(), TransferError> {
        self.retries_left = self.retries_left.saturating_sub(1);
        if self.retries_left == 0 {
            warn!("no valid reply while waiting for {:?} after {} attempts - giving up", expect, self.config.max_retries);
            return Err(TransferError::TransferAborted { attempts: self.config.max_retries });
        }

        let Some(packet) = self.last_sent.clone() else {
            return Err(TransferError::TransferAborted { attempts: self.config.max_retries });
        };
        debug!("timed out waiting for {:?} - re-sending {:?}, {} attempts left", expect, packet, self.retries_left);
        self.send_to_peer(packet).await
    }

    /// sends a packet that is part of the transfer proper, i.e. that is re-sent on timeout
    async fn send_to_peer(&mut self, packet: Packet) -> Result<(), TransferError> {
        let Some(to) = self.peer.or(self.request_dest) else {
            error!("no destination for {:?} - this is a bug", packet);
            return Err(TransferError::SocketClosed);
        };

        let buf = packet.encode()?;
        self.socket.send_datagram(to, &buf).await;
        self.last_sent = Some(packet);
        self.deadline = Instant::now() + self.config.timeout;
        Ok(())
    }

    /// sends a packet outside the regular exchange (error replies, repeated ACKs)
    async fn send_packet(&self, to: SocketAddr, packet: &Packet) {
        match packet.encode() {
            Ok(buf) => self.socket.send_datagram(to, &buf).await,
            Err(e) => error!("cannot encode {:?}: {}", packet, e),
        }
    }

    async fn violation(&mut self, message: String) -> TransferError {
        warn!("protocol violation: {}", message);
        if let Some(peer) = self.peer {
            self.send_packet(peer, &Packet::error(ErrorCode::IllegalOperation, format!("illegal operation: {}", message))).await;
        }
        TransferError::ProtocolViolation(message)
    }

    async fn file_error(&mut self, e: FileStoreError) -> TransferError {
        warn!("file store error: {}", e);
        if let Some(peer) = self.peer {
            self.send_packet(peer, &Packet::error(e.error_code(), e.to_string())).await;
        }
        e.into()
    }
}
