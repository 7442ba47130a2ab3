//! A reliable file transfer protocol in the style of TFTP (RFC 1350) over UDP, with a client, a
//!  multi-session server, and a relay that injects faults for testing the protocol's recovery.
//!
//! Transfers are lock-step: one block in flight, acknowledged before the next one is sent, with
//!  retransmission on timeout. Each side of a transfer talks from its own port, and that port is
//!  the transfer's identity - see [session::TransferSession] for the details.

pub mod client;
pub mod config;
pub mod error;
pub mod file_store;
pub mod packet;
pub mod proxy;
pub mod server;
pub mod session;
pub mod test_util;
pub mod transfer_socket;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
