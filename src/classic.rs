//! Classic NAT classification (RFC 3489)
//!
//! The legacy decision tree: Test I observes the mapped address, Test II
//! asks the server to answer from a different address and port, Test III
//! from a different port only. Which probes get answered, and whether the
//! mapping moves between destinations, pins down one of the classic NAT
//! types. The server must advertise a usable CHANGED-ADDRESS or the tree
//! cannot run at all; that case is an explicit verdict, not a guess.

use std::fmt;
use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

use crate::error::NatResult;
use crate::stun::{Attribute, Message};
use crate::transaction::{drain, Exchange, Transaction};
use crate::transport::{validate_server, StunTransport, UdpTransport};
use crate::ProbeConfig;

/// Classic NAT type verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    /// No STUN traffic passes at all
    UdpBlocked,
    /// Mapped address equals the local one and unsolicited traffic arrives
    OpenInternet,
    /// Mapped address equals the local one but unsolicited traffic is dropped
    SymmetricUdpFirewall,
    FullCone,
    RestrictedCone,
    PortRestrictedCone,
    Symmetric,
    /// The server cannot support classification (missing or degenerate
    /// CHANGED-ADDRESS, or a response without a mapped address)
    UnsupportedServer,
    /// The probes contradicted each other; no type can be claimed
    Unknown,
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NatType::UdpBlocked => write!(f, "UDP blocked"),
            NatType::OpenInternet => write!(f, "Open Internet"),
            NatType::SymmetricUdpFirewall => write!(f, "Symmetric UDP firewall"),
            NatType::FullCone => write!(f, "Full Cone NAT"),
            NatType::RestrictedCone => write!(f, "Restricted Cone NAT"),
            NatType::PortRestrictedCone => write!(f, "Port Restricted Cone NAT"),
            NatType::Symmetric => write!(f, "Symmetric NAT"),
            NatType::UnsupportedServer => write!(f, "server unsuitable for classification"),
            NatType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Result of one classic query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassicProbeResult {
    pub nat_type: NatType,
    pub public_endpoint: Option<SocketAddr>,
}

impl ClassicProbeResult {
    fn new(nat_type: NatType, public_endpoint: Option<SocketAddr>) -> Self {
        Self { nat_type, public_endpoint }
    }
}

/// RFC 3489 classifier. One instance owns one UDP transport; the same
/// local endpoint is used for every probe of a query, which is what makes
/// the mapped-address comparisons meaningful.
pub struct ClassicClient {
    server: SocketAddr,
    transport: Box<dyn StunTransport>,
    config: ProbeConfig,
    cancel: CancellationToken,
}

impl ClassicClient {
    /// Bind a fresh UDP socket at `local` and classify against `server`
    pub async fn bind(server: SocketAddr, local: SocketAddr) -> NatResult<Self> {
        validate_server(server)?;
        let transport = UdpTransport::bind(local).await?;
        Ok(Self::from_parts(server, Box::new(transport)))
    }

    /// Use a caller-supplied transport (proxied sockets, tests)
    pub fn with_transport(
        server: SocketAddr,
        transport: Box<dyn StunTransport>,
    ) -> NatResult<Self> {
        validate_server(server)?;
        Ok(Self::from_parts(server, transport))
    }

    fn from_parts(server: SocketAddr, transport: Box<dyn StunTransport>) -> Self {
        Self {
            server,
            transport,
            config: ProbeConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: ProbeConfig) -> Self {
        self.config = config;
        self
    }

    /// Token that aborts an in-flight query when canceled. A canceled
    /// query surfaces as an error, never as a NAT type.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn probe(
        &mut self,
        dest: SocketAddr,
        change_ip: bool,
        change_port: bool,
    ) -> NatResult<Option<Exchange>> {
        let mut request = Message::binding_request();
        if change_ip || change_port {
            request.add_attribute(Attribute::ChangeRequest { change_ip, change_port });
        }
        Transaction::new(request, dest, self.config.recv_timeout)
            .with_attempts(self.config.attempts)
            .run_udp(self.transport.as_mut(), &self.cancel)
            .await
    }

    /// Run the full decision tree once.
    ///
    /// Reentrancy is excluded statically: `&mut self` means a second call
    /// cannot start while one is in flight.
    pub async fn query(&mut self) -> NatResult<ClassicProbeResult> {
        let result = self.classify().await;
        if result.is_ok() {
            // Late responses to the probes above must not leak into a
            // subsequent query on the same socket.
            drain(self.transport.as_mut(), self.config.drain_grace).await;
        }
        if let Ok(result) = &result {
            tracing::info!(nat_type = %result.nat_type, "classic classification finished");
        }
        result
    }

    async fn classify(&mut self) -> NatResult<ClassicProbeResult> {
        let local = self.transport.local_addr()?;
        tracing::debug!(server = %self.server, %local, "running classic test I");

        let Some(first) = self.probe(self.server, false, false).await? else {
            return Ok(ClassicProbeResult::new(NatType::UdpBlocked, None));
        };

        let mapped = first
            .response
            .mapped_address()
            .or_else(|| first.response.xor_mapped_address());
        let changed = first.response.changed_address();

        // Validation gate: without a mapped address and a changed address
        // that actually differs from the queried endpoint, Tests II/III
        // cannot distinguish anything.
        let (Some(mapped), Some(changed)) = (mapped, changed) else {
            return Ok(ClassicProbeResult::new(NatType::UnsupportedServer, mapped));
        };
        if changed == self.server {
            return Ok(ClassicProbeResult::new(NatType::UnsupportedServer, Some(mapped)));
        }

        if mapped == local {
            // No address translation in the path; does unsolicited traffic
            // from elsewhere reach us?
            tracing::debug!("mapped equals local, running test II");
            return Ok(match self.probe(self.server, true, true).await? {
                Some(_) => ClassicProbeResult::new(NatType::OpenInternet, Some(mapped)),
                None => ClassicProbeResult::new(NatType::SymmetricUdpFirewall, Some(mapped)),
            });
        }

        tracing::debug!(%mapped, "NAT present, running test II");
        if self.probe(self.server, true, true).await?.is_some() {
            return Ok(ClassicProbeResult::new(NatType::FullCone, Some(mapped)));
        }

        // Re-run Test I against the changed address to see whether the
        // mapping depends on the destination.
        tracing::debug!(%changed, "running test I against changed address");
        let Some(second) = self.probe(changed, false, false).await? else {
            // The server answered from its primary address but not its
            // alternate one; claiming any NAT type here would be a guess.
            return Ok(ClassicProbeResult::new(NatType::Unknown, Some(mapped)));
        };
        let Some(remapped) = second
            .response
            .mapped_address()
            .or_else(|| second.response.xor_mapped_address())
        else {
            return Ok(ClassicProbeResult::new(NatType::UnsupportedServer, Some(mapped)));
        };

        if remapped != mapped {
            return Ok(ClassicProbeResult::new(NatType::Symmetric, Some(mapped)));
        }

        tracing::debug!(%changed, "mapping stable, running test III");
        Ok(match self.probe(changed, false, true).await? {
            Some(_) => ClassicProbeResult::new(NatType::RestrictedCone, Some(mapped)),
            None => ClassicProbeResult::new(NatType::PortRestrictedCone, Some(mapped)),
        })
    }
}
