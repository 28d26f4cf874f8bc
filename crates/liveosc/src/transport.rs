//! UDP transport with address-keyed dispatch and awaited request/response.
//!
//! The remote script is fire-and-forget: a query sent to address X is answered
//! by a message on the same address X. Nothing on the wire correlates a reply
//! with its request, so `call` holds a per-address lock for the duration of
//! each exchange - concurrent calls to the same address queue instead of
//! racing for each other's replies.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rosc::{OscMessage, OscPacket, OscType};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::error::{OscError, Result};

/// Address the remote script uses for its own error notifications.
pub const ERROR_ADDR: &str = "/live/error";

struct HandlerEntry {
    id: u64,
    tx: mpsc::UnboundedSender<Vec<OscType>>,
}

#[derive(Default)]
struct Registry {
    handlers: Mutex<HashMap<String, Vec<HandlerEntry>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn add(&self, addr: &str) -> (u64, mpsc::UnboundedReceiver<Vec<OscType>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut handlers = self.handlers.lock().unwrap();
        handlers
            .entry(addr.to_string())
            .or_default()
            .push(HandlerEntry { id, tx });
        (id, rx)
    }

    fn remove(&self, addr: &str, id: u64) {
        let mut handlers = self.handlers.lock().unwrap();
        if let Some(entries) = handlers.get_mut(addr) {
            entries.retain(|e| e.id != id);
            if entries.is_empty() {
                handlers.remove(addr);
            }
        }
    }

    fn dispatch(&self, addr: &str, args: &[OscType]) {
        let mut handlers = self.handlers.lock().unwrap();
        if let Some(entries) = handlers.get_mut(addr) {
            // A failed send means the subscriber is gone; drop its entry.
            entries.retain(|e| e.tx.send(args.to_vec()).is_ok());
            if entries.is_empty() {
                handlers.remove(addr);
            }
        }
    }
}

/// A live subscription to one OSC address. Unregisters itself on drop.
pub struct Subscription {
    addr: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<Vec<OscType>>,
    registry: Arc<Registry>,
}

impl Subscription {
    /// Receive the next message on this address. `None` once the dispatch
    /// side has dropped this subscription's sender.
    pub async fn recv(&mut self) -> Option<Vec<OscType>> {
        self.rx.recv().await
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.remove(&self.addr, self.id);
    }
}

/// One UDP socket pair to the DAW, shared by every session in the process.
pub struct OscTransport {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    registry: Arc<Registry>,
    call_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    recv_task: JoinHandle<()>,
}

impl OscTransport {
    /// Bind the local port and start the receive loop.
    ///
    /// A bind failure is returned to the caller; the server treats it as
    /// fatal. Port 0 binds an ephemeral port (used by tests).
    pub async fn bind(local_port: u16, remote: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", local_port))
            .await
            .map_err(|e| OscError::Bind {
                port: local_port,
                source: e,
            })?;
        let local = socket.local_addr().map_err(|e| OscError::Bind {
            port: local_port,
            source: e,
        })?;
        let socket = Arc::new(socket);
        let registry = Arc::new(Registry::default());

        let recv_socket = socket.clone();
        let recv_registry = registry.clone();
        let recv_task = tokio::spawn(async move {
            receive_loop(recv_socket, recv_registry).await;
        });

        debug!("OSC transport bound on {} -> {}", local, remote);

        Ok(Self {
            socket,
            remote,
            registry,
            call_locks: Mutex::new(HashMap::new()),
            recv_task,
        })
    }

    /// The bound local address (useful when binding port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The remote endpoint messages are sent to.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Fire-and-forget send of one OSC message.
    pub async fn send(&self, addr: &str, args: Vec<OscType>) -> Result<()> {
        let packet = OscPacket::Message(OscMessage {
            addr: addr.to_string(),
            args,
        });
        let buf = rosc::encoder::encode(&packet).map_err(|e| OscError::Encode {
            detail: e.to_string(),
        })?;
        self.socket
            .send_to(&buf, self.remote)
            .await
            .map_err(|e| OscError::Send { source: e })?;
        trace!("sent {}", addr);
        Ok(())
    }

    /// Subscribe to every inbound message on `addr`. The subscription
    /// unregisters itself when dropped.
    pub fn subscribe(&self, addr: &str) -> Subscription {
        let (id, rx) = self.registry.add(addr);
        Subscription {
            addr: addr.to_string(),
            id,
            rx,
            registry: self.registry.clone(),
        }
    }

    /// Send a request and await the reply that arrives on the same address.
    ///
    /// Calls to the same address are serialized; the reply cannot name its
    /// request, so at most one exchange per address is in flight.
    pub async fn call(
        &self,
        addr: &str,
        args: Vec<OscType>,
        timeout: Duration,
    ) -> Result<Vec<OscType>> {
        let lock = {
            let mut locks = self.call_locks.lock().unwrap();
            locks
                .entry(addr.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        // Register before sending so a fast reply cannot slip past.
        let mut sub = self.subscribe(addr);
        self.send(addr, args).await?;

        match tokio::time::timeout(timeout, sub.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(OscError::Closed),
            Err(_) => Err(OscError::Timeout {
                addr: addr.to_string(),
                ms: timeout.as_millis() as u64,
            }),
        }
    }
}

impl Drop for OscTransport {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, registry: Arc<Registry>) {
    let mut buf = vec![0u8; 65_536];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, _from)) => match rosc::decoder::decode_udp(&buf[..len]) {
                Ok((_, packet)) => dispatch_packet(&packet, &registry),
                Err(e) => warn!("discarding undecodable OSC datagram: {}", e),
            },
            Err(e) => {
                warn!("OSC receive error: {}", e);
            }
        }
    }
}

fn dispatch_packet(packet: &OscPacket, registry: &Registry) {
    match packet {
        OscPacket::Message(msg) => {
            if msg.addr == ERROR_ADDR {
                error!("DAW error: {:?}", msg.args);
            }
            trace!("recv {} ({} args)", msg.addr, msg.args.len());
            registry.dispatch(&msg.addr, &msg.args);
        }
        OscPacket::Bundle(bundle) => {
            for inner in &bundle.content {
                dispatch_packet(inner, registry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscription_unregisters_on_drop() {
        let registry = Arc::new(Registry::default());
        let (id, _rx) = registry.add("/live/test");
        assert_eq!(registry.handlers.lock().unwrap().len(), 1);

        registry.remove("/live/test", id);
        assert!(registry.handlers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dispatch_reaches_all_subscribers_on_address() {
        let registry = Arc::new(Registry::default());
        let (_id1, mut rx1) = registry.add("/live/song/get/num_tracks");
        let (_id2, mut rx2) = registry.add("/live/song/get/num_tracks");
        let (_id3, mut rx3) = registry.add("/live/test");

        registry.dispatch("/live/song/get/num_tracks", &[OscType::Int(4)]);

        assert_eq!(rx1.recv().await.unwrap(), vec![OscType::Int(4)]);
        assert_eq!(rx2.recv().await.unwrap(), vec![OscType::Int(4)]);
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn dispatch_prunes_dropped_receivers() {
        let registry = Arc::new(Registry::default());
        let (_id, rx) = registry.add("/live/test");
        drop(rx);

        registry.dispatch("/live/test", &[]);
        assert!(registry.handlers.lock().unwrap().is_empty());
    }
}
