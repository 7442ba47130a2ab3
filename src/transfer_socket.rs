use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{error, trace};

use crate::packet::MAX_PACKET_LEN;

/// Outcome of a single receive-with-timeout on a [TransferSocket]
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Received {
    Datagram { from: SocketAddr, buf: Vec<u8> },
    Timeout,
    /// The socket was closed from outside
    Closed,
}

/// This is the I/O seam of a transfer session: a bound datagram socket with a receive timeout
///  and an external 'close' signal. It is introduced to facilitate mocking the network away
///  for testing the session state machine.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransferSocket: Send + Sync + 'static {
    /// NB: send errors are logged rather than returned - a datagram that did not make it out is
    ///  indistinguishable from one that was lost on the wire, and retransmission covers both
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]);

    async fn recv_datagram(&self, timeout: Duration) -> Received;

    fn local_addr(&self) -> SocketAddr;
}

/// Signals sockets to close. Closing is sticky: a socket that starts receiving after the signal
///  was raised sees it immediately.
#[derive(Clone)]
pub struct CloseSignal {
    sender: watch::Sender<bool>,
}
impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}
impl CloseSignal {
    pub fn new() -> CloseSignal {
        let (sender, _) = watch::channel(false);
        CloseSignal { sender }
    }

    pub fn close(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> CloseListener {
        CloseListener { receiver: self.sender.subscribe() }
    }
}

#[derive(Clone)]
pub struct CloseListener {
    receiver: watch::Receiver<bool>,
}
impl CloseListener {
    /// completes once the signal is raised
    pub async fn closed(&mut self) {
        if self.receiver.wait_for(|&closed| closed).await.is_err() {
            // the signal was dropped without being raised, so it never will be
            std::future::pending::<()>().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.receiver.borrow()
    }
}

pub struct UdpTransferSocket {
    socket: UdpSocket,
    close: CloseListener,
}
impl UdpTransferSocket {
    pub async fn bind(addr: SocketAddr, close: CloseListener) -> anyhow::Result<UdpTransferSocket> {
        let socket = UdpSocket::bind(addr).await?;
        trace!("bound transfer socket to {:?}", socket.local_addr()?);
        Ok(UdpTransferSocket { socket, close })
    }

    /// binds an ephemeral port on the same interface as `local_ip_of`
    pub async fn bind_ephemeral(local_ip_of: SocketAddr, close: CloseListener) -> anyhow::Result<UdpTransferSocket> {
        Self::bind(SocketAddr::new(local_ip_of.ip(), 0), close).await
    }
}

/// Receives until a datagram arrives, the deadline passes or the socket is closed. A failed
///  receive (e.g. an ICMP 'port unreachable' surfacing on the socket) is logged and the wait goes
///  on: it neither closes the socket nor extends the deadline.
async fn receive_until<F, Fut>(deadline: Instant, close: &mut CloseListener, mut recv: F) -> Received
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<(SocketAddr, Vec<u8>)>>,
{
    loop {
        select! {
            r = recv() => {
                match r {
                    Ok((from, buf)) => return Received::Datagram { from, buf },
                    Err(e) => error!("error receiving from datagram socket: {}", e),
                }
            }
            _ = sleep_until(deadline) => return Received::Timeout,
            _ = close.closed() => return Received::Closed,
        }
    }
}

#[async_trait]
impl TransferSocket for UdpTransferSocket {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) {
        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), to);

        if let Err(e) = self.socket.send_to(buf, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }

    async fn recv_datagram(&self, timeout: Duration) -> Received {
        let mut close = self.close.clone();
        if close.is_closed() {
            return Received::Closed;
        }

        let socket = &self.socket;
        receive_until(Instant::now() + timeout, &mut close, move || async move {
            // one spare byte so that oversized datagrams are seen as such instead of being truncated
            //  into something that looks valid
            let mut buf = vec![0u8; MAX_PACKET_LEN + 1];
            let (len, from) = socket.recv_from(&mut buf).await?;
            buf.truncate(len);
            Ok((from, buf))
        }).await
    }

    fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;
    use crate::test_util::localhost;

    #[tokio::test]
    async fn test_send_and_receive() {
        let signal = CloseSignal::new();
        let a = UdpTransferSocket::bind(localhost(), signal.subscribe()).await.unwrap();
        let b = UdpTransferSocket::bind(localhost(), signal.subscribe()).await.unwrap();

        a.send_datagram(b.local_addr(), &[0, 4, 0, 1]).await;
        assert_eq!(
            b.recv_datagram(Duration::from_secs(5)).await,
            Received::Datagram { from: a.local_addr(), buf: vec![0, 4, 0, 1] },
        );
    }

    #[tokio::test]
    async fn test_timeout() {
        let signal = CloseSignal::new();
        let a = UdpTransferSocket::bind(localhost(), signal.subscribe()).await.unwrap();
        assert_eq!(a.recv_datagram(Duration::from_millis(20)).await, Received::Timeout);
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_receive() {
        let signal = CloseSignal::new();
        let a = UdpTransferSocket::bind(localhost(), signal.subscribe()).await.unwrap();

        let closer = signal.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            closer.close();
        });
        assert_eq!(a.recv_datagram(Duration::from_secs(30)).await, Received::Closed);
    }

    #[tokio::test]
    async fn test_closed_before_receive() {
        let signal = CloseSignal::new();
        let a = UdpTransferSocket::bind(localhost(), signal.subscribe()).await.unwrap();
        signal.close();
        assert!(signal.is_closed());
        assert_eq!(a.recv_datagram(Duration::from_secs(30)).await, Received::Closed);
    }

    #[tokio::test]
    async fn test_receive_error_keeps_waiting() {
        let signal = CloseSignal::new();
        let mut close = signal.subscribe();
        let from = localhost();
        let calls = AtomicUsize::new(0);

        let received = receive_until(Instant::now() + Duration::from_secs(5), &mut close, || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                match call {
                    0 | 1 => Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
                    _ => Ok((from, vec![0, 4, 0, 1])),
                }
            }
        }).await;

        assert_eq!(received, Received::Datagram { from, buf: vec![0, 4, 0, 1] });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_receive_errors_do_not_extend_deadline() {
        let signal = CloseSignal::new();
        let mut close = signal.subscribe();
        let start = Instant::now();

        let received = receive_until(start + Duration::from_millis(50), &mut close, || async {
            sleep(Duration::from_millis(5)).await;
            Err(io::Error::from(io::ErrorKind::ConnectionReset))
        }).await;

        assert_eq!(received, Received::Timeout);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
