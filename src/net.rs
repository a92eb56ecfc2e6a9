//! TCP transport
//!
//! Blocking sockets with `TCP_NODELAY`, chunked reads/writes, and a "turbo"
//! mode that flips every socket to non-blocking so collectives spin instead
//! of sleeping. The bootstrap handshake exchanges the full address list
//! through the root so that every pair of nodes ends up directly connected:
//! node `i` accepts connections from nodes `j < i` and initiates to `j > i`.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{RepartirError, Result};

/// Handshake fence value exchanged at bootstrap checkpoints
pub const ACK: u32 = 23_571_114;
/// Largest single read/write handed to the socket layer
pub const MAX_CHUNK_SIZE: usize = 65_536;
/// Socket index of the root connection on a worker
pub const ROOT_SOCKET_INDEX: usize = 0;

fn io_err(what: &str, e: &std::io::Error) -> RepartirError {
    RepartirError::Transport(format!("{what}: {e}"))
}

/// Write all of `data`, spinning through `WouldBlock` in turbo mode
fn write_socket(stream: &TcpStream, mut data: &[u8]) -> Result<()> {
    let mut stream = stream;
    while !data.is_empty() {
        match stream.write(data) {
            Ok(0) => return Err(RepartirError::SocketClosed),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(e) => return Err(io_err("write", &e)),
        }
    }
    Ok(())
}

/// Read exactly `data.len()` bytes. `max_attempts` bounds the number of
/// `WouldBlock` spins *before the first byte arrives*; 0 means spin forever.
/// Returns `false` when the attempts ran out with nothing read.
fn try_read_socket(stream: &TcpStream, data: &mut [u8], max_attempts: u64) -> Result<bool> {
    let mut stream = stream;
    let total = data.len();
    let mut filled = 0usize;
    let mut attempts = max_attempts;
    while filled < total {
        match stream.read(&mut data[filled..]) {
            Ok(0) => return Err(RepartirError::SocketClosed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if filled == 0 && max_attempts > 0 {
                    attempts -= 1;
                    if attempts == 0 {
                        return Ok(false);
                    }
                }
            }
            Err(e) => return Err(io_err("read", &e)),
        }
    }
    Ok(true)
}

fn read_socket(stream: &TcpStream, data: &mut [u8]) -> Result<()> {
    try_read_socket(stream, data, 0)?;
    Ok(())
}

fn configure_stream(stream: &TcpStream) -> Result<()> {
    stream.set_nodelay(true).map_err(|e| io_err("set nodelay", &e))?;
    Ok(())
}

fn connect_stream(host: &str, port: u16) -> Result<TcpStream> {
    let stream = TcpStream::connect((host, port)).map_err(|e| {
        RepartirError::Transport(format!("Cannot connect to {host}:{port}: {e}"))
    })?;
    configure_stream(&stream)?;
    Ok(stream)
}

fn write_ack(stream: &TcpStream) -> Result<()> {
    write_socket(stream, &ACK.to_ne_bytes())
}

fn read_ack(stream: &TcpStream) -> Result<()> {
    let mut buf = [0u8; 4];
    read_socket(stream, &mut buf)?;
    if u32::from_ne_bytes(buf) != ACK {
        return Err(RepartirError::Handshake("Invalid ack packet".to_string()));
    }
    Ok(())
}

fn read_u32(stream: &TcpStream) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_socket(stream, &mut buf)?;
    Ok(u32::from_ne_bytes(buf))
}

/// One pending transfer for [`Network::write_many`]/[`Network::read_many`]
pub struct SocketIo<'a> {
    /// Socket the transfer runs on
    pub socket_index: usize,
    /// Byte offset already completed
    pub progress: usize,
    /// Payload (destination for reads, source for writes)
    pub data: SocketIoData<'a>,
}

/// Borrowed payload of a [`SocketIo`]
pub enum SocketIoData<'a> {
    /// Outgoing bytes
    Read(&'a mut [u8]),
    /// Incoming destination
    Write(&'a [u8]),
}

impl<'a> SocketIo<'a> {
    /// Pending read into `data`
    pub fn read(socket_index: usize, data: &'a mut [u8]) -> Self {
        SocketIo { socket_index, progress: 0, data: SocketIoData::Read(data) }
    }

    /// Pending write of `data`
    pub fn write(socket_index: usize, data: &'a [u8]) -> Self {
        SocketIo { socket_index, progress: 0, data: SocketIoData::Write(data) }
    }

    fn remaining(&self) -> usize {
        match &self.data {
            SocketIoData::Read(d) => d.len() - self.progress,
            SocketIoData::Write(d) => d.len() - self.progress,
        }
    }
}

/// Fully-connected mesh of sockets to the other nodes.
///
/// On the root, socket `i` reaches worker node `i + 1`; on a worker, socket
/// 0 reaches the root and socket `i > 0` reaches worker node `i`.
pub struct Network {
    sockets: Vec<TcpStream>,
    /// This node's global index
    pub node_index: u32,
    sent_bytes: AtomicU64,
    recv_bytes: AtomicU64,
}

impl Network {
    /// Worker side of the bootstrap: listen on `port`, let the root connect,
    /// receive the address book, then connect/accept the peer mesh.
    pub fn serve(port: u16) -> Result<Network> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .map_err(|e| RepartirError::Transport(format!("Cannot bind port {port}: {e}")))?;
        tracing::info!(port, "listening for the root node");

        let (root_socket, _) = listener
            .accept()
            .map_err(|e| io_err("accept root", &e))?;
        configure_stream(&root_socket)?;
        tracing::info!("root node connected");

        let n_sockets = read_u32(&root_socket)?;
        let node_index = read_u32(&root_socket)?;
        let n_peers = (n_sockets - 1) as usize;

        let mut hosts = Vec::with_capacity(n_peers);
        for _ in 0..n_peers {
            let host_len = read_u32(&root_socket)? as usize;
            let mut host = vec![0u8; host_len];
            read_socket(&root_socket, &mut host)?;
            while host.last() == Some(&0) {
                host.pop();
            }
            let host = String::from_utf8(host)
                .map_err(|_| RepartirError::Handshake("Bad host string".to_string()))?;
            let port = read_u32(&root_socket)?;
            hosts.push((host, port as u16));
        }
        write_ack(&root_socket)?;
        // Wait for the "root is ready" fence before dialing peers.
        read_ack(&root_socket)?;

        let my_peer_slot = node_index - 1;
        let mut sockets: Vec<Option<TcpStream>> = Vec::with_capacity(n_sockets as usize);
        sockets.push(Some(root_socket));
        for _ in 0..n_peers {
            sockets.push(None);
        }
        for (i, (host, port)) in hosts.iter().enumerate() {
            let socket_index = i + 1;
            let stream = if i as u32 >= my_peer_slot {
                tracing::debug!(socket_index, host, port, "connecting to worker");
                connect_stream(host, *port)?
            } else {
                tracing::debug!(socket_index, "waiting for worker");
                let (s, _) = listener.accept().map_err(|e| io_err("accept peer", &e))?;
                configure_stream(&s)?;
                s
            };
            sockets[socket_index] = Some(stream);
        }

        tracing::info!(node_index, n_sockets, "network initialized");
        Ok(Network {
            sockets: sockets.into_iter().map(|s| s.expect("socket filled")).collect(),
            node_index,
            sent_bytes: AtomicU64::new(0),
            recv_bytes: AtomicU64::new(0),
        })
    }

    /// Root side of the bootstrap: dial every worker and send it the address
    /// book of the other workers, then release them all with an ack.
    pub fn connect(workers: &[(String, u16)]) -> Result<Network> {
        assert!(!workers.is_empty());
        let n_sockets = workers.len() as u32;

        let mut sockets = Vec::with_capacity(workers.len());
        for (i, (host, port)) in workers.iter().enumerate() {
            tracing::debug!(host, port, "connecting to worker");
            let stream = connect_stream(host, *port)?;
            write_socket(&stream, &n_sockets.to_ne_bytes())?;
            // The worker's global node index (root is node 0).
            write_socket(&stream, &((i + 1) as u32).to_ne_bytes())?;
            for (j, (peer_host, peer_port)) in workers.iter().enumerate() {
                if j == i {
                    continue;
                }
                let host_bytes = peer_host.as_bytes();
                let host_len = (host_bytes.len() + 1) as u32;
                write_socket(&stream, &host_len.to_ne_bytes())?;
                write_socket(&stream, host_bytes)?;
                write_socket(&stream, &[0u8])?;
                write_socket(&stream, &u32::from(*peer_port).to_ne_bytes())?;
            }
            read_ack(&stream)?;
            sockets.push(stream);
        }
        for stream in &sockets {
            write_ack(stream)?;
        }
        tracing::info!(n_workers = workers.len(), "network initialized");
        Ok(Network {
            sockets,
            node_index: 0,
            sent_bytes: AtomicU64::new(0),
            recv_bytes: AtomicU64::new(0),
        })
    }

    /// Wrap pre-connected streams (crate-internal test support)
    pub(crate) fn from_streams(sockets: Vec<TcpStream>, node_index: u32) -> Network {
        Network {
            sockets,
            node_index,
            sent_bytes: AtomicU64::new(0),
            recv_bytes: AtomicU64::new(0),
        }
    }

    /// Number of open sockets
    pub fn n_sockets(&self) -> usize {
        self.sockets.len()
    }

    /// Toggle non-blocking mode on every socket
    pub fn set_turbo(&self, enabled: bool) -> Result<()> {
        for socket in &self.sockets {
            socket
                .set_nonblocking(enabled)
                .map_err(|e| io_err("set nonblocking", &e))?;
        }
        Ok(())
    }

    /// Socket index reaching `target_node` from this node
    pub fn socket_index_for_node(&self, target_node: u32) -> usize {
        if self.node_index == 0 {
            // Root: worker node n sits on socket n - 1.
            (target_node - 1) as usize
        } else if target_node == 0 {
            ROOT_SOCKET_INDEX
        } else if target_node < self.node_index {
            // Peer list skips this node, so lower ids keep their slot and
            // higher ids shift down by one.
            target_node as usize
        } else {
            (target_node - 1) as usize
        }
    }

    /// Write `data` to one socket (chunked)
    pub fn write(&self, socket_index: usize, data: &[u8]) -> Result<()> {
        let stream = &self.sockets[socket_index];
        for chunk in data.chunks(MAX_CHUNK_SIZE) {
            write_socket(stream, chunk)?;
        }
        self.sent_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Read exactly `data.len()` bytes from one socket (chunked)
    pub fn read(&self, socket_index: usize, data: &mut [u8]) -> Result<()> {
        let stream = &self.sockets[socket_index];
        for chunk in data.chunks_mut(MAX_CHUNK_SIZE) {
            read_socket(stream, chunk)?;
        }
        self.recv_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Bounded read: gives up after `max_attempts` empty non-blocking polls.
    pub fn try_read_with_max_attempts(
        &self,
        socket_index: usize,
        data: &mut [u8],
        max_attempts: u64,
    ) -> Result<bool> {
        if try_read_socket(&self.sockets[socket_index], data, max_attempts)? {
            self.recv_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Send an ack fence
    pub fn write_ack(&self, socket_index: usize) -> Result<()> {
        write_ack(&self.sockets[socket_index])
    }

    /// Receive and verify an ack fence
    pub fn read_ack(&self, socket_index: usize) -> Result<()> {
        read_ack(&self.sockets[socket_index])
    }

    /// Drive several writes concurrently, round-robin over the sockets so a
    /// slow peer does not serialize the others.
    pub fn write_many(&self, ios: &mut [SocketIo<'_>]) -> Result<()> {
        let total: usize = ios.iter().map(SocketIo::remaining).sum();
        loop {
            let mut busy = false;
            for io in ios.iter_mut() {
                let remaining = io.remaining();
                if remaining == 0 {
                    continue;
                }
                busy = true;
                let SocketIoData::Write(data) = &io.data else {
                    return Err(RepartirError::Transport("write_many got a read io".to_string()));
                };
                let chunk = remaining.min(MAX_CHUNK_SIZE);
                let mut stream = &self.sockets[io.socket_index];
                match stream.write(&data[io.progress..io.progress + chunk]) {
                    Ok(0) => return Err(RepartirError::SocketClosed),
                    Ok(n) => io.progress += n,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(e) => return Err(io_err("write", &e)),
                }
            }
            if !busy {
                break;
            }
        }
        self.sent_bytes.fetch_add(total as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Drive several reads concurrently, round-robin over the sockets.
    pub fn read_many(&self, ios: &mut [SocketIo<'_>]) -> Result<()> {
        let total: usize = ios.iter().map(SocketIo::remaining).sum();
        loop {
            let mut busy = false;
            for io in ios.iter_mut() {
                let remaining = io.remaining();
                if remaining == 0 {
                    continue;
                }
                busy = true;
                let SocketIoData::Read(data) = &mut io.data else {
                    return Err(RepartirError::Transport("read_many got a write io".to_string()));
                };
                let mut stream = &self.sockets[io.socket_index];
                match stream.read(&mut data[io.progress..]) {
                    Ok(0) => return Err(RepartirError::SocketClosed),
                    Ok(n) => io.progress += n,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(e) => return Err(io_err("read", &e)),
                }
            }
            if !busy {
                break;
            }
        }
        self.recv_bytes.fetch_add(total as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Write `data` to every socket
    pub fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut ios: Vec<SocketIo<'_>> = (0..self.sockets.len())
            .map(|i| SocketIo::write(i, data))
            .collect();
        self.write_many(&mut ios)
    }

    /// Point-to-point send to a node
    pub fn send_to_node(&self, target_node: u32, data: &[u8]) -> Result<()> {
        self.write(self.socket_index_for_node(target_node), data)
    }

    /// Point-to-point receive from a node
    pub fn recv_from_node(&self, source_node: u32, data: &mut [u8]) -> Result<()> {
        self.read(self.socket_index_for_node(source_node), data)
    }

    /// Drain and return the (sent, received) byte counters
    pub fn take_stats(&self) -> (u64, u64) {
        (
            self.sent_bytes.swap(0, Ordering::Relaxed),
            self.recv_bytes.swap(0, Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        (a, b)
    }

    fn network_of(stream: TcpStream, node_index: u32) -> Network {
        Network {
            sockets: vec![stream],
            node_index,
            sent_bytes: AtomicU64::new(0),
            recv_bytes: AtomicU64::new(0),
        }
    }

    #[test]
    fn test_write_read_roundtrip() {
        let (a, b) = socket_pair();
        let net_a = network_of(a, 0);
        let net_b = network_of(b, 1);

        let payload: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
        let sender = std::thread::spawn(move || {
            net_a.write(0, &payload).unwrap();
            net_a.take_stats().0
        });
        let mut received = vec![0u8; 200_000];
        net_b.read(0, &mut received).unwrap();
        let sent = sender.join().unwrap();
        assert_eq!(sent, 200_000);
        assert_eq!(net_b.take_stats().1, 200_000);
        assert_eq!(received[..100], (0..100).map(|i| i as u8).collect::<Vec<_>>()[..]);
    }

    #[test]
    fn test_ack_fence() {
        let (a, b) = socket_pair();
        let net_a = network_of(a, 0);
        let net_b = network_of(b, 1);
        net_a.write_ack(0).unwrap();
        net_b.read_ack(0).unwrap();
        // A wrong value is rejected.
        net_a.write(0, &123u32.to_ne_bytes()).unwrap();
        assert!(net_b.read_ack(0).is_err());
    }

    #[test]
    fn test_bounded_read_gives_up() {
        let (a, b) = socket_pair();
        let net_b = network_of(b, 1);
        net_b.set_turbo(true).unwrap();
        let mut buf = [0u8; 4];
        let got = net_b.try_read_with_max_attempts(0, &mut buf, 100).unwrap();
        assert!(!got);
        drop(a);
    }

    #[test]
    fn test_socket_index_mapping() {
        let (a, b) = socket_pair();
        let root = network_of(a, 0);
        assert_eq!(root.socket_index_for_node(1), 0);
        assert_eq!(root.socket_index_for_node(3), 2);
        let worker = network_of(b, 2);
        assert_eq!(worker.socket_index_for_node(0), 0);
        assert_eq!(worker.socket_index_for_node(1), 1);
        assert_eq!(worker.socket_index_for_node(3), 2);
    }

    #[test]
    fn test_closed_socket_is_transport_error() {
        let (a, b) = socket_pair();
        drop(a);
        let net_b = network_of(b, 1);
        let mut buf = [0u8; 4];
        let err = net_b.read(0, &mut buf).unwrap_err();
        assert!(err.is_transport());
    }
}
