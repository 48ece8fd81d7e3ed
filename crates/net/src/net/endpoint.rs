use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};

use super::stats::NetworkStats;

const RECV_BUFFER_SIZE: usize = 2048;

/// Non-blocking UDP socket.
pub struct UdpEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    stats: NetworkStats,
    recv_buffer: [u8; RECV_BUFFER_SIZE],
}

impl UdpEndpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            stats: NetworkStats::default(),
            recv_buffer: [0u8; RECV_BUFFER_SIZE],
        })
    }

    /// Binds the first free port in `port..port + range`.
    pub fn bind_in_range(ip: IpAddr, port: u16, range: u16) -> io::Result<Self> {
        let mut last_error = None;
        for offset in 0..range.max(1) {
            let Some(candidate) = port.checked_add(offset) else {
                break;
            };
            match Self::bind(SocketAddr::new(ip, candidate)) {
                Ok(endpoint) => return Ok(endpoint),
                Err(e) => {
                    log::debug!("Port {} unavailable: {}", candidate, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrInUse, "no port available in range")
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let bytes = self.socket.send_to(data, addr)?;
        self.stats.record_sent(bytes);
        Ok(bytes)
    }

    /// Drains every datagram currently queued on the socket.
    pub fn receive(&mut self) -> io::Result<Vec<(Vec<u8>, SocketAddr)>> {
        let mut datagrams = Vec::new();

        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => {
                    self.stats.record_received(size);
                    datagrams.push((self.recv_buffer[..size].to_vec(), addr));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // ICMP port-unreachable from an earlier send surfaces here on some platforms.
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(datagrams)
    }
}

/// Non-blocking TCP listener.
pub struct TcpEndpoint {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpEndpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn accept(&self) -> io::Result<Option<TcpChannel>> {
        match self.listener.accept() {
            Ok((stream, _)) => TcpChannel::from_stream(stream).map(Some),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Non-blocking TCP stream. Sends and receives return zero when the
/// operation would block.
pub struct TcpChannel {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl TcpChannel {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Self::from_stream(TcpStream::connect(addr)?)
    }

    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        Ok(Self { stream, peer_addr })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        match self.stream.write(data) {
            Ok(bytes) => Ok(bytes),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Returns `ConnectionAborted` once the peer has closed the stream.
    pub fn receive(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        match self.stream.read(buffer) {
            Ok(0) if !buffer.is_empty() => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "peer closed the stream",
            )),
            Ok(bytes) => Ok(bytes),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::thread;
    use std::time::{Duration, Instant};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn test_udp_receive_returns_empty_when_idle() {
        let mut endpoint = UdpEndpoint::bind((LOCALHOST, 0)).unwrap();
        assert!(endpoint.receive().unwrap().is_empty());
    }

    #[test]
    fn test_udp_round_trip() {
        let mut a = UdpEndpoint::bind((LOCALHOST, 0)).unwrap();
        let mut b = UdpEndpoint::bind((LOCALHOST, 0)).unwrap();

        a.send_to(b"hello", b.local_addr()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut received = Vec::new();
        while received.is_empty() && Instant::now() < deadline {
            received = b.receive().unwrap();
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, b"hello");
        assert_eq!(received[0].1, a.local_addr());
        assert_eq!(a.stats().packets_sent, 1);
        assert_eq!(b.stats().bytes_received, 5);
    }

    #[test]
    fn test_bind_in_range_skips_taken_port() {
        let taken = UdpEndpoint::bind((LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().port();
        if port == u16::MAX {
            return;
        }

        match UdpEndpoint::bind_in_range(LOCALHOST, port, 2) {
            Ok(endpoint) => assert_eq!(endpoint.local_addr().port(), port + 1),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::AddrInUse),
        }
    }

    #[test]
    fn test_tcp_channel() {
        let listener = TcpEndpoint::bind((LOCALHOST, 0)).unwrap();
        let mut client = TcpChannel::connect(listener.local_addr()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut server = None;
        while server.is_none() && Instant::now() < deadline {
            server = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(1));
        }
        let mut server = server.unwrap();

        let mut buffer = [0u8; 16];
        assert_eq!(server.receive(&mut buffer).unwrap(), 0);

        assert_eq!(client.send(b"ping").unwrap(), 4);
        let mut read = 0;
        while read == 0 && Instant::now() < deadline {
            read = server.receive(&mut buffer).unwrap();
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(&buffer[..read], b"ping");
    }
}
