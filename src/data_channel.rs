//! Ephemeral data channels: one listener, one accepted connection, one transfer.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};

use socket2::{Domain, Protocol, Socket, Type};

/// Listening half of a data channel. Consumed by `accept`, so the listener
/// is closed as soon as its single peer has connected.
#[derive(Debug)]
pub struct DataListener {
    listener: TcpListener,
    port: u16,
}

impl DataListener {
    /// Bind an OS-assigned port on the wildcard address of `family`'s kind,
    /// with room for exactly one pending connection.
    pub fn bind(family: IpAddr) -> io::Result<Self> {
        let ip = match family {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let addr = SocketAddr::new(ip, 0);
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.bind(&addr.into())?;
        socket.listen(1)?;
        let listener: TcpListener = socket.into();
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Loopback address that reaches this listener; connecting to it
    /// unblocks a pending `accept`.
    pub fn wake_addr(&self) -> SocketAddr {
        let ip = match self.listener.local_addr().map(|a| a.ip()) {
            Ok(IpAddr::V6(_)) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
        };
        SocketAddr::new(ip, self.port)
    }

    /// Block until one peer connects.
    pub fn accept(self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept()?;
        tune_socket(&stream);
        Ok((stream, peer))
    }
}

/// Open the initiating side of a data channel.
pub fn connect(ip: IpAddr, port: u16) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(SocketAddr::new(ip, port))?;
    tune_socket(&stream);
    Ok(stream)
}

// Disable Nagle; control replies are tiny and latency bound
pub fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
}
