//! Transaction engine: one request, one matched response
//!
//! A [`Transaction`] owns everything about an in-flight request: the
//! message, the destination, the per-attempt deadline and the retry
//! budget. Responses are correlated purely by the transaction identifier;
//! anything that fails to parse or matches a different transaction is
//! discarded and the wait continues until the deadline. A timeout and a
//! transport error are the same outcome for classification (`Ok(None)`);
//! cancellation is not, and surfaces as [`NatError::Canceled`] so that a
//! user-initiated abort can never masquerade as a NAT verdict.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{NatError, NatResult};
use crate::stun::{Message, MAX_MESSAGE_SIZE};
use crate::transport::{ProbeTransport, StunTransport, TcpConnector};

/// Outcome of a matched exchange: the response plus the endpoints that
/// observed it. The source address matters to the filtering tests; the
/// local address matters to TCP tests, where every exchange runs on its
/// own connection.
#[derive(Debug)]
pub struct Exchange {
    pub response: Message,
    pub source: SocketAddr,
    pub local: SocketAddr,
}

/// An in-flight STUN request
pub struct Transaction {
    request: Message,
    destination: SocketAddr,
    per_attempt_timeout: Duration,
    attempts: u32,
}

impl Transaction {
    pub fn new(request: Message, destination: SocketAddr, per_attempt_timeout: Duration) -> Self {
        Self {
            request,
            destination,
            per_attempt_timeout,
            attempts: 1,
        }
    }

    /// Set the retry budget. Each attempt is a full send/receive pair with
    /// its own fixed deadline; there is no backoff between attempts.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Run over whichever transport the session uses
    pub async fn run(
        &self,
        transport: &mut ProbeTransport,
        cancel: &CancellationToken,
    ) -> NatResult<Option<Exchange>> {
        match transport {
            ProbeTransport::Udp(t) => self.run_udp(t.as_mut(), cancel).await,
            ProbeTransport::Tcp(c) => self.run_tcp(*c, cancel).await,
        }
    }

    /// UDP exchange on a shared, already-bound socket
    pub async fn run_udp(
        &self,
        transport: &mut dyn StunTransport,
        cancel: &CancellationToken,
    ) -> NatResult<Option<Exchange>> {
        let data = self.request.encode()?;
        let local = transport.local_addr()?;

        for attempt in 1..=self.attempts {
            if cancel.is_cancelled() {
                return Err(NatError::Canceled);
            }
            if let Err(e) = transport.send_to(&data, self.destination).await {
                tracing::debug!(dest = %self.destination, error = %e, "send failed");
                return Ok(None);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(NatError::Canceled),
                res = timeout(self.per_attempt_timeout, self.wait_match(transport)) => {
                    match res {
                        Ok(Ok((response, source))) => {
                            return Ok(Some(Exchange { response, source, local }));
                        }
                        Ok(Err(e)) => {
                            tracing::debug!(dest = %self.destination, error = %e, "receive failed");
                            return Ok(None);
                        }
                        Err(_) => {
                            tracing::debug!(
                                dest = %self.destination,
                                attempt,
                                "no response within {:?}",
                                self.per_attempt_timeout
                            );
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    /// Receive until a datagram parses and matches this transaction. The
    /// caller bounds this with the per-attempt deadline, so a matching
    /// packet arriving after the deadline is never observed here.
    async fn wait_match(
        &self,
        transport: &mut dyn StunTransport,
    ) -> NatResult<(Message, SocketAddr)> {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        loop {
            let (len, source) = transport.recv_from(&mut buf).await?;
            match Message::parse(&buf[..len]) {
                Ok(response) if self.request.is_same_transaction(&response) => {
                    return Ok((response, source));
                }
                Ok(_) => {
                    tracing::debug!(%source, "discarding response for another transaction");
                }
                Err(e) => {
                    tracing::debug!(%source, error = %e, "discarding undecodable datagram");
                }
            }
        }
    }

    /// TCP exchange: fresh connection, write, incremental read until the
    /// declared frame is buffered, then close.
    pub async fn run_tcp(
        &self,
        connector: TcpConnector,
        cancel: &CancellationToken,
    ) -> NatResult<Option<Exchange>> {
        tokio::select! {
            _ = cancel.cancelled() => Err(NatError::Canceled),
            res = self.tcp_exchange(connector) => Ok(res),
        }
    }

    async fn tcp_exchange(&self, connector: TcpConnector) -> Option<Exchange> {
        let data = self.request.encode().ok()?;

        let socket = if self.destination.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .ok()?;
        // Fresh source port per test: one TCP mapping observation is tied
        // to the connection that produced it.
        socket
            .bind(SocketAddr::new(connector.local.ip(), 0))
            .ok()?;

        let mut stream = match timeout(connector.connect_timeout, socket.connect(self.destination))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::debug!(dest = %self.destination, error = %e, "connect failed");
                return None;
            }
            Err(_) => {
                tracing::debug!(dest = %self.destination, "connect timed out");
                return None;
            }
        };

        let local = stream.local_addr().ok()?;
        let source = stream.peer_addr().unwrap_or(self.destination);

        if let Err(e) = stream.write_all(&data).await {
            tracing::debug!(dest = %self.destination, error = %e, "write failed");
            return None;
        }

        let read_frame = async {
            let mut acc = BytesMut::with_capacity(MAX_MESSAGE_SIZE);
            let mut chunk = [0u8; 1024];
            loop {
                if let Some(frame_len) = Message::frame_length(&acc) {
                    if acc.len() >= frame_len {
                        return Message::parse(&acc[..frame_len]).ok();
                    }
                }
                match stream.read(&mut chunk).await {
                    Ok(0) => return None,
                    Ok(n) => acc.extend_from_slice(&chunk[..n]),
                    Err(_) => return None,
                }
            }
        };

        match timeout(self.per_attempt_timeout, read_frame).await {
            Ok(Some(response)) if self.request.is_same_transaction(&response) => {
                Some(Exchange { response, source, local })
            }
            Ok(_) => None,
            Err(_) => {
                tracing::debug!(dest = %self.destination, "no complete response within deadline");
                None
            }
        }
        // stream drops here, closing the connection
    }
}

/// Read-and-discard residual datagrams so a late answer to one test cannot
/// be mistaken for the answer to the next.
pub async fn drain(transport: &mut dyn StunTransport, grace: Duration) {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    while let Ok(Ok((_, source))) = timeout(grace, transport.recv_from(&mut buf)).await {
        tracing::debug!(%source, "discarded residual datagram");
    }
}

/// Drain helper for session transports; TCP sessions have nothing queued
/// because every test closed its own connection.
pub async fn drain_session(transport: &mut ProbeTransport, grace: Duration) {
    if let ProbeTransport::Udp(t) = transport {
        drain(t.as_mut(), grace).await;
    }
}
