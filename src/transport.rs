//! Transport abstraction for STUN exchanges
//!
//! The classifiers depend only on the [`StunTransport`] trait, so tests
//! substitute a scripted transport instead of reaching into classifier
//! internals, and callers can route traffic through a proxy by supplying
//! their own implementation. The default implementation is a plain tokio
//! UDP socket; TCP tests are described by a [`TcpConnector`] because each
//! TCP test opens (and closes) its own connection.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::error::{NatError, NatResult};

/// Datagram-style transport used for one discovery session.
///
/// The same instance (and therefore the same local endpoint) is reused for
/// every test of a query; receive calls carry no internal timeout, the
/// transaction engine owns the deadline.
#[async_trait]
pub trait StunTransport: Send {
    /// Local endpoint the transport is bound to
    fn local_addr(&self) -> NatResult<SocketAddr>;

    /// Send one datagram to `dest`
    async fn send_to(&mut self, data: &[u8], dest: SocketAddr) -> NatResult<()>;

    /// Receive one datagram, returning its size and source
    async fn recv_from(&mut self, buf: &mut [u8]) -> NatResult<(usize, SocketAddr)>;
}

/// Default UDP transport over a tokio socket
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind a socket to `local` (use port 0 for an ephemeral port)
    pub async fn bind(local: SocketAddr) -> NatResult<Self> {
        let socket = UdpSocket::bind(local).await?;
        Ok(Self { socket })
    }
}

#[async_trait]
impl StunTransport for UdpTransport {
    fn local_addr(&self) -> NatResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    async fn send_to(&mut self, data: &[u8], dest: SocketAddr) -> NatResult<()> {
        self.socket.send_to(data, dest).await?;
        Ok(())
    }

    async fn recv_from(&mut self, buf: &mut [u8]) -> NatResult<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }
}

/// How to open the per-test TCP connections of a discovery session.
///
/// Binding tests over TCP tie each observation to one connection's source
/// port, so a fresh ephemeral port is used per connect regardless of the
/// configured port.
#[derive(Debug, Clone, Copy)]
pub struct TcpConnector {
    /// Local address to bind; the port is always rebound as 0
    pub local: SocketAddr,
    /// Deadline for establishing each connection
    pub connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(local: SocketAddr, connect_timeout: Duration) -> Self {
        Self { local, connect_timeout }
    }
}

/// The transport a behavior-discovery session runs over: one reusable UDP
/// socket, or a reconnect-per-test TCP description.
pub enum ProbeTransport {
    Udp(Box<dyn StunTransport>),
    Tcp(TcpConnector),
}

impl ProbeTransport {
    pub fn is_udp(&self) -> bool {
        matches!(self, ProbeTransport::Udp(_))
    }

    /// Local endpoint of the session. For TCP this is the configured bind
    /// address; the effective per-test endpoint is reported by each
    /// exchange instead.
    pub fn local_addr(&self) -> NatResult<SocketAddr> {
        match self {
            ProbeTransport::Udp(t) => t.local_addr(),
            ProbeTransport::Tcp(c) => Ok(c.local),
        }
    }
}

/// Fail construction early on arguments that can never carry a query.
pub(crate) fn validate_server(server: SocketAddr) -> NatResult<()> {
    if server.port() == 0 {
        return Err(NatError::Configuration(format!(
            "server endpoint {server} has port 0"
        )));
    }
    if server.ip().is_unspecified() {
        return Err(NatError::Configuration(format!(
            "server endpoint {server} is unspecified"
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted transport for classifier tests.
    //!
    //! Each `send_to` consumes the next rule; whatever datagrams the rule
    //! returns become available to `recv_from`. An exhausted script, or a
    //! rule returning nothing, leaves the receiver pending so the engine's
    //! timeout fires.

    use std::collections::VecDeque;

    use super::*;
    use crate::stun::Message;

    type Rule = Box<dyn FnMut(&Message, SocketAddr) -> Vec<(Vec<u8>, SocketAddr)> + Send>;

    pub struct MockTransport {
        local: SocketAddr,
        rules: VecDeque<Rule>,
        inbox: VecDeque<(Vec<u8>, SocketAddr)>,
        pub sent: Vec<(Message, SocketAddr)>,
    }

    impl MockTransport {
        pub fn new(local: SocketAddr) -> Self {
            Self {
                local,
                rules: VecDeque::new(),
                inbox: VecDeque::new(),
                sent: Vec::new(),
            }
        }

        /// Queue the reaction to the next outgoing request
        pub fn on_send<F>(&mut self, rule: F)
        where
            F: FnMut(&Message, SocketAddr) -> Vec<(Vec<u8>, SocketAddr)> + Send + 'static,
        {
            self.rules.push_back(Box::new(rule));
        }

        /// Queue a well-formed reply built from the request
        pub fn reply_with<F>(&mut self, mut build: F)
        where
            F: FnMut(&Message) -> (Message, SocketAddr) + Send + 'static,
        {
            self.on_send(move |req, _dest| {
                let (msg, source) = build(req);
                vec![(msg.encode().unwrap().to_vec(), source)]
            });
        }

        /// Queue a dropped request (the engine will time out)
        pub fn silence(&mut self) {
            self.on_send(|_, _| Vec::new());
        }
    }

    #[async_trait]
    impl StunTransport for MockTransport {
        fn local_addr(&self) -> NatResult<SocketAddr> {
            Ok(self.local)
        }

        async fn send_to(&mut self, data: &[u8], dest: SocketAddr) -> NatResult<()> {
            let request = Message::parse(data).expect("test sent an undecodable request");
            self.sent.push((request.clone(), dest));
            if let Some(mut rule) = self.rules.pop_front() {
                self.inbox.extend(rule(&request, dest));
            }
            Ok(())
        }

        async fn recv_from(&mut self, buf: &mut [u8]) -> NatResult<(usize, SocketAddr)> {
            match self.inbox.pop_front() {
                Some((data, source)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok((data.len(), source))
                }
                None => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }
}
