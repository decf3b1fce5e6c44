//! NAT behavior discovery (RFC 5389 binding, RFC 5780 mapping/filtering)
//!
//! Three independent tests over one session. The binding test observes the
//! reflexive address. The mapping test compares that mapping across server
//! destinations to learn how the NAT allocates ports. The filtering test
//! asks the server to answer from addresses we never sent to, to learn
//! which inbound sources the NAT lets through; it only makes sense over
//! UDP. Every test needs the server to advertise a second address
//! (OTHER-ADDRESS, or legacy CHANGED-ADDRESS) that differs from the
//! queried one in both address and port; servers that don't are reported
//! as unsupported rather than guessed around.

use std::fmt;
use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

use crate::error::{NatError, NatResult};
use crate::stun::{Attribute, Message};
use crate::transaction::{drain_session, Transaction};
use crate::transport::{validate_server, ProbeTransport, TcpConnector, UdpTransport};
use crate::ProbeConfig;

/// Outcome of the plain binding test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindingTestResult {
    #[default]
    Unknown,
    Success,
    /// No usable response
    Fail,
    /// Response carried no XOR-MAPPED-ADDRESS
    UnsupportedServer,
}

/// How the NAT maps one internal socket across destinations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MappingBehavior {
    #[default]
    Unknown,
    /// A sub-test got no usable response
    Fail,
    /// Public endpoint equals the local one; nothing is translated
    Direct,
    EndpointIndependent,
    AddressDependent,
    AddressAndPortDependent,
    /// Server lacks a distinct OTHER-ADDRESS, or answered degenerately
    UnsupportedServer,
}

/// Which inbound sources reach a previously used mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilteringBehavior {
    #[default]
    Unknown,
    Fail,
    Direct,
    EndpointIndependent,
    AddressDependent,
    AddressAndPortDependent,
    UnsupportedServer,
}

impl fmt::Display for BindingTestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingTestResult::Unknown => write!(f, "not tested"),
            BindingTestResult::Success => write!(f, "success"),
            BindingTestResult::Fail => write!(f, "failed"),
            BindingTestResult::UnsupportedServer => write!(f, "server unsupported"),
        }
    }
}

impl fmt::Display for MappingBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingBehavior::Unknown => write!(f, "not tested"),
            MappingBehavior::Fail => write!(f, "test failed"),
            MappingBehavior::Direct => write!(f, "direct (no translation)"),
            MappingBehavior::EndpointIndependent => write!(f, "endpoint independent"),
            MappingBehavior::AddressDependent => write!(f, "address dependent"),
            MappingBehavior::AddressAndPortDependent => write!(f, "address and port dependent"),
            MappingBehavior::UnsupportedServer => write!(f, "server unsupported"),
        }
    }
}

impl fmt::Display for FilteringBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilteringBehavior::Unknown => write!(f, "not tested"),
            FilteringBehavior::Fail => write!(f, "test failed"),
            FilteringBehavior::Direct => write!(f, "direct (no filtering)"),
            FilteringBehavior::EndpointIndependent => write!(f, "endpoint independent"),
            FilteringBehavior::AddressDependent => write!(f, "address dependent"),
            FilteringBehavior::AddressAndPortDependent => write!(f, "address and port dependent"),
            FilteringBehavior::UnsupportedServer => write!(f, "server unsupported"),
        }
    }
}

/// Accumulated result of one discovery session. Starts all-Unknown; each
/// sub-test fills its verdict and whichever endpoints it observed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BehaviorProbeResult {
    pub binding: BindingTestResult,
    pub mapping: MappingBehavior,
    pub filtering: FilteringBehavior,
    pub local_endpoint: Option<SocketAddr>,
    pub public_endpoint: Option<SocketAddr>,
    pub other_endpoint: Option<SocketAddr>,
}

impl BehaviorProbeResult {
    /// Return to the all-Unknown initial state for reuse across queries
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// What one binding exchange told us
enum BindingProbe {
    NoResponse,
    /// Responded, but without XOR-MAPPED-ADDRESS
    Degenerate,
    Mapped {
        public: SocketAddr,
        other: Option<SocketAddr>,
        local: SocketAddr,
    },
}

/// RFC 5389/5780 discovery client.
///
/// UDP sessions reuse one socket (and therefore one local endpoint) for
/// every test; TCP sessions open a fresh connection per test because each
/// TCP mapping observation is tied to its connection's source port.
/// Reentrancy is excluded statically: every test takes `&mut self`.
pub struct BehaviorClient {
    server: SocketAddr,
    transport: ProbeTransport,
    config: ProbeConfig,
    cancel: CancellationToken,
    result: BehaviorProbeResult,
}

impl BehaviorClient {
    /// UDP session bound at `local`
    pub async fn bind_udp(server: SocketAddr, local: SocketAddr) -> NatResult<Self> {
        validate_server(server)?;
        let transport = UdpTransport::bind(local).await?;
        Ok(Self::from_parts(server, ProbeTransport::Udp(Box::new(transport))))
    }

    /// TCP session connecting from `local` (a fresh ephemeral port per test)
    pub fn tcp(server: SocketAddr, local: SocketAddr) -> NatResult<Self> {
        validate_server(server)?;
        let connect_timeout = ProbeConfig::default().connect_timeout;
        Ok(Self::from_parts(
            server,
            ProbeTransport::Tcp(TcpConnector::new(local, connect_timeout)),
        ))
    }

    /// Use a caller-supplied transport (proxied sockets, tests)
    pub fn with_transport(server: SocketAddr, transport: ProbeTransport) -> NatResult<Self> {
        validate_server(server)?;
        Ok(Self::from_parts(server, transport))
    }

    fn from_parts(server: SocketAddr, transport: ProbeTransport) -> Self {
        Self {
            server,
            transport,
            config: ProbeConfig::default(),
            cancel: CancellationToken::new(),
            result: BehaviorProbeResult::default(),
        }
    }

    pub fn with_config(mut self, config: ProbeConfig) -> Self {
        if let ProbeTransport::Tcp(connector) = &mut self.transport {
            connector.connect_timeout = config.connect_timeout;
        }
        self.config = config;
        self
    }

    /// Token that aborts an in-flight test when canceled. A canceled test
    /// surfaces as an error, never as a behavior verdict.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The result accumulated so far
    pub fn result(&self) -> &BehaviorProbeResult {
        &self.result
    }

    /// Clear the accumulated result before a fresh query
    pub fn reset(&mut self) {
        self.result.reset();
    }

    async fn exchange(
        &mut self,
        request: Message,
        dest: SocketAddr,
    ) -> NatResult<Option<crate::transaction::Exchange>> {
        Transaction::new(request, dest, self.config.recv_timeout)
            .with_attempts(self.config.attempts)
            .run(&mut self.transport, &self.cancel)
            .await
    }

    async fn binding_probe(&mut self, dest: SocketAddr) -> NatResult<BindingProbe> {
        match self.exchange(Message::binding_request(), dest).await? {
            None => Ok(BindingProbe::NoResponse),
            Some(exchange) => match exchange.response.xor_mapped_address() {
                None => Ok(BindingProbe::Degenerate),
                Some(public) => Ok(BindingProbe::Mapped {
                    public,
                    other: exchange
                        .response
                        .other_address()
                        .or_else(|| exchange.response.changed_address()),
                    local: exchange.local,
                }),
            },
        }
    }

    /// Binding exchange against the primary address, recording the verdict
    /// and observed endpoints. Every public test starts here.
    async fn first_binding(&mut self) -> NatResult<BindingProbe> {
        let probe = self.binding_probe(self.server).await?;
        match &probe {
            BindingProbe::NoResponse => {
                self.result.binding = BindingTestResult::Fail;
            }
            BindingProbe::Degenerate => {
                self.result.binding = BindingTestResult::UnsupportedServer;
            }
            BindingProbe::Mapped { public, other, local } => {
                self.result.binding = BindingTestResult::Success;
                self.result.local_endpoint = Some(*local);
                self.result.public_endpoint = Some(*public);
                self.result.other_endpoint = *other;
            }
        }
        Ok(probe)
    }

    /// A second address usable for mapping/filtering tests must differ
    /// from the queried server in both address and port.
    fn usable_other(&self, other: Option<SocketAddr>) -> Option<SocketAddr> {
        let other = other?;
        if other.ip() == self.server.ip() || other.port() == self.server.port() {
            return None;
        }
        Some(other)
    }

    /// Plain binding test: does the server reflect our endpoint at all?
    pub async fn binding_test(&mut self) -> NatResult<BindingTestResult> {
        tracing::debug!(server = %self.server, "running binding test");
        self.first_binding().await?;
        drain_session(&mut self.transport, self.config.drain_grace).await;
        tracing::info!(verdict = %self.result.binding, "binding test finished");
        Ok(self.result.binding)
    }

    /// Mapping behavior test (RFC 5780 §4.3)
    pub async fn mapping_behavior_test(&mut self) -> NatResult<MappingBehavior> {
        tracing::debug!(server = %self.server, "running mapping behavior test");
        let verdict = self.mapping_inner().await?;
        self.result.mapping = verdict;
        drain_session(&mut self.transport, self.config.drain_grace).await;
        tracing::info!(%verdict, "mapping behavior test finished");
        Ok(verdict)
    }

    async fn mapping_inner(&mut self) -> NatResult<MappingBehavior> {
        // Test 1: where does the primary address see us?
        let (public, other, local) = match self.first_binding().await? {
            BindingProbe::NoResponse => return Ok(MappingBehavior::Fail),
            BindingProbe::Degenerate => return Ok(MappingBehavior::UnsupportedServer),
            BindingProbe::Mapped { public, other, local } => (public, other, local),
        };

        let Some(other_addr) = self.usable_other(other) else {
            return Ok(MappingBehavior::UnsupportedServer);
        };

        if public == local {
            // The reflexive address is our own; no mapping exists to probe.
            return Ok(MappingBehavior::Direct);
        }

        // Test 2: same server, alternate address, primary port.
        let dest2 = SocketAddr::new(other_addr.ip(), self.server.port());
        let second = match self.binding_probe(dest2).await? {
            BindingProbe::NoResponse => return Ok(MappingBehavior::Fail),
            BindingProbe::Degenerate => return Ok(MappingBehavior::UnsupportedServer),
            BindingProbe::Mapped { public, .. } => public,
        };
        if second == public {
            return Ok(MappingBehavior::EndpointIndependent);
        }

        // Test 3: alternate address and port.
        let third = match self.binding_probe(other_addr).await? {
            BindingProbe::NoResponse => return Ok(MappingBehavior::Fail),
            BindingProbe::Degenerate => return Ok(MappingBehavior::UnsupportedServer),
            BindingProbe::Mapped { public, .. } => public,
        };
        Ok(if third == second {
            MappingBehavior::AddressDependent
        } else {
            MappingBehavior::AddressAndPortDependent
        })
    }

    /// Filtering behavior test (RFC 5780 §4.4). UDP only: a TCP mapping
    /// admits nothing unsolicited, so the probe has no meaning there.
    pub async fn filtering_behavior_test(&mut self) -> NatResult<FilteringBehavior> {
        if !self.transport.is_udp() {
            return Err(NatError::Unsupported("filtering behavior test over TCP"));
        }
        tracing::debug!(server = %self.server, "running filtering behavior test");
        let verdict = self.filtering_inner().await?;
        self.result.filtering = verdict;
        drain_session(&mut self.transport, self.config.drain_grace).await;
        tracing::info!(%verdict, "filtering behavior test finished");
        Ok(verdict)
    }

    async fn filtering_inner(&mut self) -> NatResult<FilteringBehavior> {
        let (_, other, _) = match self.first_binding().await? {
            BindingProbe::NoResponse => return Ok(FilteringBehavior::Fail),
            BindingProbe::Degenerate => return Ok(FilteringBehavior::UnsupportedServer),
            BindingProbe::Mapped { public, other, local } => (public, other, local),
        };
        if self.usable_other(other).is_none() {
            return Ok(FilteringBehavior::UnsupportedServer);
        }

        // Test 2: answer from the alternate address and port. Receiving it
        // means the NAT filters on neither.
        let mut request = Message::binding_request();
        request.add_attribute(Attribute::ChangeRequest { change_ip: true, change_port: true });
        if self.exchange(request, self.server).await?.is_some() {
            return Ok(FilteringBehavior::EndpointIndependent);
        }

        // Test 3: answer from the primary address, alternate port. The
        // verdict hinges on the observed source of the response; a server
        // that answers from its primary endpoint anyway is indistinguishable
        // from a broken one.
        let mut request = Message::binding_request();
        request.add_attribute(Attribute::ChangeRequest { change_ip: false, change_port: true });
        match self.exchange(request, self.server).await? {
            Some(exchange)
                if exchange.source.ip() == self.server.ip()
                    && exchange.source.port() != self.server.port() =>
            {
                Ok(FilteringBehavior::AddressAndPortDependent)
            }
            _ => Ok(FilteringBehavior::UnsupportedServer),
        }
    }

    /// One-shot composition: binding, then mapping, then (UDP) filtering.
    /// A failed prerequisite short-circuits the rest, leaving those fields
    /// Unknown.
    pub async fn query(&mut self) -> NatResult<BehaviorProbeResult> {
        self.result.reset();

        if self.binding_test().await? != BindingTestResult::Success {
            return Ok(self.result.clone());
        }

        let mapping = self.mapping_behavior_test().await?;
        if matches!(mapping, MappingBehavior::Fail | MappingBehavior::UnsupportedServer) {
            return Ok(self.result.clone());
        }

        if self.transport.is_udp() {
            self.filtering_behavior_test().await?;
        }

        Ok(self.result.clone())
    }
}
