//! A relay between client and server that injects faults into selected datagrams.
//!
//! The client talks to the proxy as if it were the server. The proxy forwards each request from
//!  a dedicated relay socket, so the server's session replies there, and it forwards the replies
//!  to the client from that same relay socket. Both ends therefore see the relay socket as their
//!  peer's transfer ID, and the proxy sees every datagram of the transfer.

pub mod fault_rule;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::config::TftpConfig;
use crate::packet::{ErrorCode, Packet};
use crate::proxy::fault_rule::{ErrorCorruption, ErrorCorruptionTarget, FaultAction, FaultRule};
use crate::transfer_socket::{CloseSignal, Received, TransferSocket, UdpTransferSocket};

/// How long a throwaway socket waits for the 'unknown transfer ID' error after sending from the
///  wrong transfer ID
const WRONG_TID_WINDOW: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Fault {
    Rule(FaultAction),
    CorruptError(ErrorCorruptionTarget),
}

/// A fault that was applied, for reporting
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InjectedFault {
    pub fault: Fault,
    /// the packet as it was before the fault was applied
    pub packet: String,
    /// for [FaultAction::WrongTid]: whether the receiver rejected the datagram as it should
    pub rejected_as_unknown_tid: Option<bool>,
}

/// The transfer currently being relayed
struct RelayMapping {
    client: SocketAddr,
    /// the server session's transfer ID, learned from its first reply
    server: Option<SocketAddr>,
    /// set once the server session sent an ERROR and therefore terminated. A retransmitted
    ///  request may then start a new session on a new transfer ID.
    server_terminated: bool,
    relay: Arc<UdpTransferSocket>,
}

enum Source {
    Listener,
    Relay,
}

pub struct FaultInjectionProxy {
    config: Arc<TftpConfig>,
    listener: UdpTransferSocket,
    rules: Vec<FaultRule>,
    error_corruption: Option<ErrorCorruption>,
    mapping: Option<RelayMapping>,
    close: CloseSignal,
    injected: Arc<Mutex<Vec<InjectedFault>>>,
}

/// Controls a running [FaultInjectionProxy]
pub struct ProxyHandle {
    local_addr: SocketAddr,
    close: CloseSignal,
    injected: Arc<Mutex<Vec<InjectedFault>>>,
    task: JoinHandle<()>,
}

impl ProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn injected_faults(&self) -> Vec<InjectedFault> {
        match self.injected.lock() {
            Ok(injected) => injected.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// closes the listener and the relay socket
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.close.close();
        self.task.await?;
        Ok(())
    }
}

impl FaultInjectionProxy {
    pub async fn bind(config: Arc<TftpConfig>, rules: Vec<FaultRule>, error_corruption: Option<ErrorCorruption>) -> anyhow::Result<FaultInjectionProxy> {
        config.validate()?;

        let close = CloseSignal::new();
        let listener = UdpTransferSocket::bind(config.proxy_addr, close.subscribe()).await?;
        info!("proxy listening on {:?}, relaying to {:?}", listener.local_addr(), config.server_addr);
        for rule in &rules {
            info!("fault rule: {}", rule);
        }
        if let Some(corruption) = &error_corruption {
            info!("error packet corruption: {:?}", corruption);
        }

        Ok(FaultInjectionProxy {
            config,
            listener,
            rules,
            error_corruption,
            mapping: None,
            close,
            injected: Default::default(),
        })
    }

    pub async fn start(config: Arc<TftpConfig>, rules: Vec<FaultRule>, error_corruption: Option<ErrorCorruption>) -> anyhow::Result<ProxyHandle> {
        let proxy = Self::bind(config, rules, error_corruption).await?;
        let local_addr = proxy.listener.local_addr();
        let close = proxy.close.clone();
        let injected = proxy.injected.clone();

        Ok(ProxyHandle {
            local_addr,
            close,
            injected,
            task: tokio::spawn(proxy.run()),
        })
    }

    pub async fn run(mut self) {
        loop {
            let timeout = self.config.timeout;
            let (source, received) = match &self.mapping {
                None => (Source::Listener, self.listener.recv_datagram(timeout).await),
                Some(mapping) => select! {
                    r = self.listener.recv_datagram(timeout) => (Source::Listener, r),
                    r = mapping.relay.recv_datagram(timeout) => (Source::Relay, r),
                },
            };

            let (from, buf) = match received {
                Received::Datagram { from, buf } => (from, buf),
                Received::Timeout => continue,
                Received::Closed => break,
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "relay", ?correlation_id);
            match source {
                Source::Listener => self.on_request(from, buf).instrument(span).await,
                Source::Relay => self.on_relayed(from, buf).instrument(span).await,
            }
        }
        info!("proxy shut down");
    }

    /// a datagram from a client to the well-known port
    async fn on_request(&mut self, from: SocketAddr, buf: Vec<u8>) {
        let relay = match &mut self.mapping {
            Some(mapping) if mapping.client == from => {
                // ignored by the server while its session runs
                debug!("retransmitted request from {:?}", from);
                mapping.relay.clone()
            }
            _ => {
                let relay = match UdpTransferSocket::bind_ephemeral(self.listener.local_addr(), self.close.subscribe()).await {
                    Ok(relay) => Arc::new(relay),
                    Err(e) => {
                        warn!("cannot open relay socket for {:?}: {}", from, e);
                        return;
                    }
                };
                debug!("new transfer from {:?}, relaying through {:?}", from, relay.local_addr());
                self.mapping = Some(RelayMapping { client: from, server: None, server_terminated: false, relay: relay.clone() });
                relay
            }
        };

        let to = self.config.server_addr;
        self.forward(buf, to, relay).await;
    }

    /// a datagram on the relay socket, from either the client or the server's session
    async fn on_relayed(&mut self, from: SocketAddr, buf: Vec<u8>) {
        let Some(mapping) = &mut self.mapping else {
            return;
        };

        let to = if from == mapping.client {
            match mapping.server {
                Some(server) => server,
                None => {
                    debug!("dropping datagram from {:?}, no server session has replied yet", from);
                    return;
                }
            }
        }
        else {
            match mapping.server {
                Some(server) if server == from => {}
                Some(server) if !mapping.server_terminated => {
                    debug!("dropping datagram from {:?} which is not part of the relayed transfer with {:?}", from, server);
                    return;
                }
                _ => {
                    debug!("server session for {:?} is at {:?}", mapping.client, from);
                    mapping.server = Some(from);
                }
            }
            mapping.server_terminated = matches!(Packet::decode(&buf), Ok(Packet::Error { .. }));
            mapping.client
        };

        let relay = mapping.relay.clone();
        self.forward(buf, to, relay).await;
    }

    async fn forward(&mut self, mut buf: Vec<u8>, to: SocketAddr, relay: Arc<UdpTransferSocket>) {
        let packet = match Packet::decode(&buf) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("relaying undecodable datagram to {:?}: {}", to, e);
                relay.send_datagram(to, &buf).await;
                return;
            }
        };

        if let Packet::Error { .. } = packet {
            if let Some(corruption) = &mut self.error_corruption {
                if corruption.apply(&mut buf) {
                    let target = corruption.target;
                    info!("corrupting {:?} ({:?}) on its way to {:?}", packet, target, to);
                    self.record(Fault::CorruptError(target), &packet, None);
                }
            }
        }

        let Some(rule) = self.rules.iter_mut().find(|r| r.matches(&packet)) else {
            trace!("relaying {:?} to {:?}", packet, to);
            relay.send_datagram(to, &buf).await;
            return;
        };
        rule.fire();
        let action = rule.action;
        rule.mutate(&mut buf);
        info!("injecting {:?} into {:?} on its way to {:?}", action, packet, to);

        let mut rejected_as_unknown_tid = None;
        match action {
            FaultAction::Lose => {}
            FaultAction::Delay(delay) => {
                sleep(delay).await;
                relay.send_datagram(to, &buf).await;
            }
            FaultAction::Duplicate(delay) => {
                relay.send_datagram(to, &buf).await;
                sleep(delay).await;
                relay.send_datagram(to, &buf).await;
            }
            FaultAction::WrongTid => {
                rejected_as_unknown_tid = Some(self.send_from_wrong_tid(to, &buf).await);
            }
            FaultAction::CorruptOpcode | FaultAction::CorruptField(_) => {
                relay.send_datagram(to, &buf).await;
            }
        }
        self.record(Fault::Rule(action), &packet, rejected_as_unknown_tid);
    }

    /// Sends `buf` from a throwaway socket and returns whether the receiver answered with an
    ///  'unknown transfer ID' error
    async fn send_from_wrong_tid(&self, to: SocketAddr, buf: &[u8]) -> bool {
        let socket = match UdpTransferSocket::bind_ephemeral(self.listener.local_addr(), self.close.subscribe()).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("cannot open throwaway socket: {}", e);
                return false;
            }
        };
        socket.send_datagram(to, buf).await;

        match socket.recv_datagram(WRONG_TID_WINDOW).await {
            Received::Datagram { from, buf } => match Packet::decode(&buf) {
                Ok(Packet::Error { code: ErrorCode::UnknownTransferId, .. }) => {
                    info!("{:?} rejected the datagram from the wrong transfer ID", from);
                    true
                }
                other => {
                    warn!("{:?} answered the datagram from the wrong transfer ID with {:?}", from, other);
                    false
                }
            },
            Received::Timeout | Received::Closed => {
                warn!("{:?} did not reject the datagram from the wrong transfer ID", to);
                false
            }
        }
    }

    fn record(&self, fault: Fault, packet: &Packet, rejected_as_unknown_tid: Option<bool>) {
        let fault = InjectedFault { fault, packet: format!("{:?}", packet), rejected_as_unknown_tid };
        match self.injected.lock() {
            Ok(mut injected) => injected.push(fault),
            Err(poisoned) => poisoned.into_inner().push(fault),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::TftpClient;
    use crate::error::TransferError;
    use crate::proxy::fault_rule::FieldTarget;
    use crate::server::{ServerDispatcher, ServerHandle};
    use crate::test_util::{localhost, InMemoryFileStore};
    use rstest::rstest;

    struct Setup {
        server: ServerHandle,
        server_store: Arc<InMemoryFileStore>,
        proxy: ProxyHandle,
        client_config: Arc<TftpConfig>,
    }

    fn config(server_addr: SocketAddr) -> Arc<TftpConfig> {
        Arc::new(TftpConfig {
            server_addr,
            proxy_addr: localhost(),
            timeout: Duration::from_millis(200),
            max_retries: 5,
            ..TftpConfig::default()
        })
    }

    async fn setup(rules: &[&str], error_corruption: Option<&str>) -> Setup {
        let server_store = Arc::new(InMemoryFileStore::new());
        let server = ServerDispatcher::start(config(localhost()), server_store.clone()).await.unwrap();

        let rules = rules.iter()
            .map(|r| r.parse::<FaultRule>().unwrap())
            .collect();
        let error_corruption = error_corruption.map(|c| c.parse::<ErrorCorruption>().unwrap());
        let proxy_config = config(server.local_addr());
        let proxy = FaultInjectionProxy::start(proxy_config.clone(), rules, error_corruption).await.unwrap();

        Setup { server, server_store, proxy, client_config: proxy_config }
    }

    impl Setup {
        async fn upload(&self, content: &[u8]) -> anyhow::Result<()> {
            let store = Arc::new(InMemoryFileStore::new());
            store.insert("local", content.to_vec());
            let client = TftpClient::new(self.client_config.clone(), self.proxy.local_addr(), store);
            client.upload("local", "remote").await
        }

        /// fetches the server's "remote" and returns what the client stored locally
        async fn download(&self) -> anyhow::Result<Option<Vec<u8>>> {
            let store = Arc::new(InMemoryFileStore::new());
            let client = TftpClient::new(self.client_config.clone(), self.proxy.local_addr(), store.clone());
            client.download("remote", "local").await?;
            Ok(store.get("local"))
        }

        async fn shutdown(self) {
            self.proxy.shutdown().await.unwrap();
            self.server.shutdown().await.unwrap();
        }
    }

    fn content() -> Vec<u8> {
        (0..1200).map(|i| (i % 200) as u8).collect()
    }

    #[rstest]
    #[case::no_fault(&[])]
    #[case::lose_data(&["data:2=lose"])]
    #[case::lose_ack(&["ack:1=lose"])]
    #[case::lose_ack_0(&["ack:0=lose"])]
    #[case::lose_request(&["wrq=lose"])]
    #[case::delay_ack(&["ack:2=delay:300"])]
    #[case::duplicate_data(&["data:1=duplicate:20"])]
    #[case::corrupt_data_opcode(&["data:1=corrupt-opcode"])]
    #[case::corrupt_request_opcode(&["wrq=corrupt-opcode"])]
    #[case::corrupt_request_terminator(&["wrq=corrupt-field:last-nul"])]
    #[case::corrupt_request_file_name_terminator(&["wrq=corrupt-field:first-nul"])]
    #[case::data_with_old_block(&["data:2=corrupt-field:block:1"])]
    #[case::data_from_wrong_tid(&["data:2=wrong-tid"])]
    #[case::ack_from_wrong_tid(&["ack:1=wrong-tid"])]
    #[case::several(&["data:1=lose", "ack:2=lose", "data:3=duplicate:10"])]
    #[tokio::test]
    async fn test_upload_survives_fault(#[case] rules: &[&str]) {
        let s = setup(rules, None).await;

        s.upload(&content()).await.unwrap();

        assert_eq!(s.server_store.get("remote"), Some(content()));
        assert_eq!(s.proxy.injected_faults().len(), rules.len());
        s.shutdown().await;
    }

    #[rstest]
    #[case::no_fault(&[])]
    #[case::lose_request(&["rrq=lose"])]
    #[case::lose_data_1(&["data:1=lose"])]
    #[case::lose_data(&["data:2=lose"])]
    #[case::lose_ack(&["ack:1=lose"])]
    #[case::delay_data_1(&["data:1=delay:250"])]
    #[case::duplicate_data(&["data:2=duplicate:20"])]
    #[case::duplicate_last_data(&["data:3=duplicate:20"])]
    #[case::data_with_old_block(&["data:3=corrupt-field:block:2"])]
    #[case::data_from_wrong_tid(&["data:2=wrong-tid"])]
    #[case::ack_from_wrong_tid(&["ack:2=wrong-tid"])]
    #[tokio::test]
    async fn test_download_survives_fault(#[case] rules: &[&str]) {
        let s = setup(rules, None).await;
        s.server_store.insert("remote", content());

        let downloaded = s.download().await.unwrap();

        assert_eq!(downloaded, Some(content()));
        assert_eq!(s.proxy.injected_faults().len(), rules.len());
        s.shutdown().await;
    }

    /// ACK 0 arrives after the client's timeout, so the client retransmits its request while
    ///  the server session is already running. The transfer must go on with that session.
    #[tokio::test]
    async fn test_late_handoff_reply_keeps_server_session() {
        for _ in 0..5 {
            let s = setup(&["ack:0=delay:250"], None).await;

            s.upload(&content()).await.unwrap();

            assert_eq!(s.server_store.get("remote"), Some(content()));
            s.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_lost_data_is_reported() {
        let s = setup(&["data:2=lose"], None).await;

        s.upload(&content()).await.unwrap();

        assert_eq!(s.proxy.injected_faults(), vec![InjectedFault {
            fault: Fault::Rule(FaultAction::Lose),
            packet: "DATA(2:512b)".to_string(),
            rejected_as_unknown_tid: None,
        }]);
        s.shutdown().await;
    }

    #[rstest]
    #[case::data("data:2=wrong-tid")]
    #[case::ack("ack:1=wrong-tid")]
    #[tokio::test]
    async fn test_wrong_tid_is_rejected(#[case] rule: &str) {
        let s = setup(&[rule], None).await;

        s.upload(&content()).await.unwrap();

        let injected = s.proxy.injected_faults();
        assert_eq!(injected.len(), 1);
        assert_eq!(injected[0].fault, Fault::Rule(FaultAction::WrongTid));
        assert_eq!(injected[0].rejected_as_unknown_tid, Some(true));
        s.shutdown().await;
    }

    #[tokio::test]
    async fn test_repeating_rule_fires_on_every_match() {
        let s = setup(&["ack=delay:1@repeat"], None).await;

        s.upload(&content()).await.unwrap();

        // ACK 0 to ACK 3
        assert_eq!(s.proxy.injected_faults().len(), 4);
        s.shutdown().await;
    }

    #[tokio::test]
    async fn test_future_ack_aborts_transfer() {
        let s = setup(&["ack:1=corrupt-field:block:7"], None).await;

        let e = s.upload(&content()).await.unwrap_err();

        assert!(matches!(e.downcast_ref::<TransferError>(), Some(TransferError::ProtocolViolation(_))));
        assert_eq!(s.proxy.injected_faults()[0].fault, Fault::Rule(FaultAction::CorruptField(FieldTarget::Block(7))));
        s.shutdown().await;
    }

    #[tokio::test]
    async fn test_corrupted_mode_is_rejected() {
        let s = setup(&["wrq=corrupt-field:mode"], None).await;

        let e = s.upload(&content()).await.unwrap_err();

        assert!(matches!(e.downcast_ref::<TransferError>(), Some(TransferError::RemoteError { code: ErrorCode::IllegalOperation, .. })));
        assert_eq!(s.server_store.get("remote"), None);
        s.shutdown().await;
    }

    #[tokio::test]
    async fn test_corrupted_error_packet_is_discarded() {
        let s = setup(&[], Some("error-code")).await;
        s.server_store.insert("remote", vec![1]);

        // the corrupted ERROR is discarded. The retransmitted request is rejected again by a new
        //  server session, on a new transfer ID.
        let e = s.upload(&content()).await.unwrap_err();

        assert!(matches!(e.downcast_ref::<TransferError>(), Some(TransferError::RemoteError { code: ErrorCode::FileAlreadyExists, .. })));
        let injected = s.proxy.injected_faults();
        assert_eq!(injected.len(), 1);
        assert_eq!(injected[0].fault, Fault::CorruptError(ErrorCorruptionTarget::ErrorCode));
        s.shutdown().await;
    }

    #[tokio::test]
    async fn test_consecutive_transfers_from_different_clients() {
        let s = setup(&[], None).await;

        s.upload(b"first").await.unwrap();
        s.server_store.insert("remote", Vec::new());
        let e = s.upload(b"second").await.unwrap_err();
        assert!(matches!(e.downcast_ref::<TransferError>(), Some(TransferError::RemoteError { code: ErrorCode::FileAlreadyExists, .. })));

        s.shutdown().await;
    }
}
