use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// Abstraction for sending one datagram, introduced to mock the I/O part away for testing
///  channel logic against expected bytes.
///
/// Sending is fire-and-forget. A send error is swallowed after logging: losing a datagram is
///  indistinguishable from network loss and the reliable machinery compensates, and the one
///  error that is actually expected - the socket being closed by a racing teardown - must not
///  propagate out of a flush.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]);
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) {
        trace!("sending {} byte datagram to {:?}", buf.len(), to);

        if let Err(e) = self.send_to(buf, to).await {
            debug!("error sending datagram to {:?}: {} - dropping", to, e);
        }
    }
}
