//! Non-blocking UDP. No delivery or ordering guarantees; the message channel
//! upstream handles loss, duplication, and reordering.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use super::NET_MAX_PACKET_SIZE;

pub struct Socket {
    socket: UdpSocket,
    recv_buffer: [u8; NET_MAX_PACKET_SIZE],
}

impl Socket {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            recv_buffer: [0u8; NET_MAX_PACKET_SIZE],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn send(&self, addr: SocketAddr, data: &[u8]) -> usize {
        debug_assert!(data.len() <= NET_MAX_PACKET_SIZE);
        match self.socket.send_to(data, addr) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::debug!("udp send to {addr} failed: {err}");
                0
            }
        }
    }

    /// One datagram, or `None` once the socket is drained.
    pub fn recv(&mut self) -> Option<(SocketAddr, &[u8])> {
        match self.socket.recv_from(&mut self.recv_buffer) {
            Ok((size, addr)) => Some((addr, &self.recv_buffer[..size])),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => None,
            Err(err) => {
                log::debug!("udp recv failed: {err}");
                None
            }
        }
    }
}

pub fn address_equals(a: SocketAddr, b: SocketAddr) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_recv_loopback() {
        let mut receiver = Socket::bind("127.0.0.1:0").unwrap();
        let sender = Socket::bind("127.0.0.1:0").unwrap();
        let dest = receiver.local_addr().unwrap();

        sender.send(dest, b"hello");

        let start = std::time::Instant::now();
        loop {
            if let Some((_, data)) = receiver.recv() {
                assert_eq!(data, b"hello");
                break;
            }
            assert!(start.elapsed().as_secs() < 2, "datagram never arrived");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    #[test]
    fn test_recv_nonblocking_when_empty() {
        let mut socket = Socket::bind("127.0.0.1:0").unwrap();
        assert!(socket.recv().is_none());
    }
}
