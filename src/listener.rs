use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use anyhow::Context;
use bytes::Bytes;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::node::Node;

/// One bound UDP socket plus the task that reads from it. Several peers share a listener's
///  socket for sending; the listener owns the receive side.
pub struct Listener {
    socket: Arc<UdpSocket>,
    port: u16,
    /// when set to n, one in n inbound datagrams is dropped before processing
    simulated_loss: Mutex<Option<u32>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    /// Binds to the given port on all interfaces; port 0 picks an ephemeral port. The
    ///  receive task is not started yet, see [`Listener::start`].
    pub async fn bind(port: u16) -> anyhow::Result<Arc<Listener>> {
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port))).await
            .with_context(|| format!("binding UDP port {}", port))?;
        let port = socket.local_addr()?.port();
        info!("listening on UDP port {}", port);

        Ok(Arc::new(Listener {
            socket: Arc::new(socket),
            port,
            simulated_loss: Mutex::new(None),
            recv_task: Mutex::new(None),
        }))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Drop one in `n` inbound datagrams, for exercising the retransmission machinery in
    ///  tests and demos. `None` turns the simulation off.
    pub fn set_simulated_loss(&self, one_in: Option<u32>) {
        debug_assert!(one_in != Some(0));
        *self.simulated_loss.lock().unwrap() = one_in;
    }

    fn should_drop(&self) -> bool {
        match *self.simulated_loss.lock().unwrap() {
            Some(one_in) => rand::thread_rng().gen_range(0..one_in) == 0,
            None => false,
        }
    }

    /// Spawns the receive loop. The task holds only a weak reference to the node so a
    ///  dropped node shuts the loop down rather than the loop keeping the node alive.
    pub fn start(self: &Arc<Self>, node: Weak<Node>) {
        let listener = self.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match listener.socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        let Some(node) = node.upgrade() else {
                            break;
                        };
                        if listener.should_drop() {
                            debug!("simulated loss: dropping {} byte datagram from {:?}", len, from);
                            continue;
                        }
                        node.on_datagram(&listener, from, Bytes::copy_from_slice(&buf[..len])).await;
                    }
                    Err(e) => {
                        let Some(node) = node.upgrade() else {
                            break;
                        };
                        if node.is_closing() {
                            // the expected way for this loop to end: teardown closed the socket
                            break;
                        }
                        error!("error receiving on port {}: {}", listener.port, e);
                        node.report_reception_error(&e);
                        break;
                    }
                }
            }
            debug!("receive loop on port {} terminated", listener.port);
        });

        let previous = self.recv_task.lock().unwrap().replace(task);
        if let Some(previous) = previous {
            warn!("receive loop on port {} was already running - replacing it", self.port);
            previous.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(task) = self.recv_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}
