use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::channels::handshake::{ConnectResult, DisconnectReason};

/// Connection-level events produced on the receive and flush paths. They are queued here and
///  only turned into callback invocations when the application calls `Node::sync`, so user
///  code never runs on an I/O task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Connect(SocketAddr, ConnectResult),
    Disconnect(SocketAddr, DisconnectReason),
    ReceptionError(i32),
}

#[derive(Default)]
pub struct EventQueue {
    queue: Mutex<VecDeque<NodeEvent>>,
}

impl EventQueue {
    pub fn push(&self, event: NodeEvent) {
        self.queue.lock().unwrap().push_back(event);
    }

    pub fn drain(&self) -> Vec<NodeEvent> {
        self.queue.lock().unwrap().drain(..).collect()
    }
}

type ConnectCallback = Box<dyn Fn(SocketAddr, ConnectResult) + Send + Sync>;
type DisconnectCallback = Box<dyn Fn(SocketAddr, DisconnectReason) + Send + Sync>;
type MessageCallback = Box<dyn Fn(u8, &[u8], SocketAddr, u8) + Send + Sync>;
type ReceptionErrorCallback = Box<dyn Fn(i32) + Send + Sync>;

/// Explicit subscriber lists. All callbacks are invoked from `Node::sync` on the caller's
///  task, one event at a time.
#[derive(Default)]
pub struct Subscribers {
    on_connect: Mutex<Vec<ConnectCallback>>,
    on_disconnect: Mutex<Vec<DisconnectCallback>>,
    on_message: Mutex<Vec<MessageCallback>>,
    on_reception_error: Mutex<Vec<ReceptionErrorCallback>>,
}

impl Subscribers {
    pub fn subscribe_connect(&self, f: ConnectCallback) {
        self.on_connect.lock().unwrap().push(f);
    }

    pub fn subscribe_disconnect(&self, f: DisconnectCallback) {
        self.on_disconnect.lock().unwrap().push(f);
    }

    pub fn subscribe_message(&self, f: MessageCallback) {
        self.on_message.lock().unwrap().push(f);
    }

    pub fn subscribe_reception_error(&self, f: ReceptionErrorCallback) {
        self.on_reception_error.lock().unwrap().push(f);
    }

    pub fn emit_message(&self, type_id: u8, payload: &[u8], from: SocketAddr, channel: u8) {
        for f in self.on_message.lock().unwrap().iter() {
            f(type_id, payload, from, channel);
        }
    }

    pub fn emit(&self, event: &NodeEvent) {
        match event {
            NodeEvent::Connect(addr, result) => {
                for f in self.on_connect.lock().unwrap().iter() {
                    f(*addr, *result);
                }
            }
            NodeEvent::Disconnect(addr, reason) => {
                for f in self.on_disconnect.lock().unwrap().iter() {
                    f(*addr, *reason);
                }
            }
            NodeEvent::ReceptionError(code) => {
                for f in self.on_reception_error.lock().unwrap().iter() {
                    f(*code);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_queue_drains_in_order() {
        let queue = EventQueue::default();
        queue.push(NodeEvent::ReceptionError(1));
        queue.push(NodeEvent::ReceptionError(2));

        assert_eq!(
            queue.drain(),
            vec![NodeEvent::ReceptionError(1), NodeEvent::ReceptionError(2)]
        );
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_all_subscribers_invoked() {
        let subscribers = Subscribers::default();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            subscribers.subscribe_reception_error(Box::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        subscribers.emit(&NodeEvent::ReceptionError(7));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
