//! The PCP client: one session per process, tracking mappings per interface and
//! address family, renewing them from the reactor's periodic timeout and
//! applying gateway responses as they arrive.
//!
//! A family is started with [`PcpClient::start`], which opens its socket and
//! registers it with a [`Reactor`]. From then on the reactor drives everything:
//! readability delivers one datagram to [`PcpClient::on_datagram`], and the
//! timeout runs [`PcpClient::maintain`].

use std::{
    cell::RefCell,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6},
    rc::Rc,
    time::{Duration, Instant},
};

use tracing::{debug, info, trace, warn};

use crate::{
    addr::{self, Ipv6Kind},
    mapping::{MappingState, MappingTable, PortMapping, Visit},
    net::{Family, InterfaceId, Network, NetworkInterface, SocketError, SystemNetwork, Transport},
    pcp::{MapData, Message, Nonce, OpcodeData, Request, Response, ResultCode},
    reactor::{self, Descriptor, Handler, Interest, Reactor, Readiness},
    Protocol, CLIENT_PORT, MAX_DATAGRAM_SIZE, SERVER_PORT,
};

/// Client tuning. The defaults match what routers expect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Period of the renewal check. Rounded down to whole seconds, at least one.
    pub maintenance_interval: Duration,
    /// Local port requests are sent from and announcements arrive on.
    pub client_port: u16,
    /// Port the gateway serves PCP on.
    pub server_port: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            maintenance_interval: Duration::from_secs(1),
            client_port: CLIENT_PORT,
            server_port: SERVER_PORT,
        }
    }
}

impl ClientConfig {
    fn timeout_seconds(&self) -> u32 {
        u32::try_from(self.maintenance_interval.as_secs())
            .unwrap_or(u32::MAX)
            .max(1)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Opening, binding or joining the multicast groups failed.
    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error("Failed to send to {target}: {source}")]
    Send { target: SocketAddr, source: io::Error },

    #[error("Failed to receive: {0}")]
    Receive(#[source] io::Error),

    #[error("Interface {0} has no {1} configuration")]
    NoAddress(InterfaceId, Family),

    /// None of the interface's IPv6 addresses shares a leading bit with the router.
    #[error("No address of interface {0} shares a prefix with its IPv6 router")]
    NoRouterMatch(InterfaceId),

    #[error("PCP is not running for {family} on interface {interface}")]
    NotStarted {
        interface: InterfaceId,
        family: Family,
    },

    #[error("Unknown interface {0}")]
    UnknownInterface(InterfaceId),

    #[error(transparent)]
    Reactor(#[from] reactor::Error),
}

/// The PCP session of one address family on one interface.
struct FamilyState {
    interface: InterfaceId,
    family: Family,
    transport: Box<dyn Transport>,
    descriptor: Descriptor,
    /// Sent as the client address of every request.
    client_address: IpAddr,
    /// The gateway's PCP endpoint.
    router: SocketAddr,
    mappings: MappingTable,
    /// Last epoch reported by the router, `None` until the first response.
    epoch: Option<u32>,
    /// Set on a transport error. The reactor handler tears the family down.
    faulted: bool,
    last_maintained: Instant,
}

impl FamilyState {
    fn send_map(&self, mapping: &PortMapping) -> Result<(), Error> {
        send_map(&*self.transport, self.router, self.client_address, mapping)
    }

    fn fault(&mut self, error: &Error) {
        if !self.faulted {
            warn!(interface = %self.interface, family = %self.family, "PCP transport failed, stopping: {error}");
            self.faulted = true;
        }
    }

    fn maintain(&mut self, now: Instant) -> Result<(), Error> {
        self.last_maintained = now;
        let (transport, router, client) = (&*self.transport, self.router, self.client_address);
        let mut result = Ok(());
        self.mappings.for_each(|m| {
            let resend = match m.state {
                MappingState::Requested => true,
                MappingState::Granted if m.expires_at.is_some_and(|e| now >= e) => {
                    debug!(nonce = %m.nonce, external = %m.external, "mapping expired, requesting again");
                    m.state = MappingState::Requested;
                    true
                }
                MappingState::Granted => m.remaining(now) < m.lifetime / 3,
            };
            if resend && result.is_ok() {
                trace!(nonce = %m.nonce, state = ?m.state, "sending MAP request");
                result = send_map(transport, router, client, m);
            }
            Visit::Keep
        });
        result
    }

    /// Send one renewal for every granted mapping.
    fn renew_all(&mut self) -> Result<(), Error> {
        self.mappings
            .iter()
            .filter(|m| m.state == MappingState::Granted)
            .try_for_each(|m| self.send_map(m))
    }

    /// Record the router epoch and renew everything if it went backwards.
    fn observe_epoch(&mut self, epoch: u32) -> Result<(), Error> {
        match self.epoch.replace(epoch) {
            Some(previous) if epoch < previous => {
                info!(
                    interface = %self.interface,
                    family = %self.family,
                    previous,
                    epoch,
                    "router lost its state, renewing all mappings"
                );
                self.renew_all()
            }
            _ => Ok(()),
        }
    }

    fn handle_datagram(
        &mut self,
        bytes: &[u8],
        link_local: Option<Ipv6Addr>,
        now: Instant,
    ) -> Result<(), Error> {
        let response = match Message::decode(bytes) {
            Ok(Message::Response(response)) => response,
            // An ANNOUNCE without the response bit has no epoch field, so only
            // responses are honored.
            Ok(Message::Request(request)) => {
                trace!(opcode = ?request.data.opcode(), "ignoring PCP request");
                return Ok(());
            }
            Ok(Message::NatPmp(response)) => {
                debug!(?response, "ignoring NAT-PMP response");
                return Ok(());
            }
            Err(e) => {
                warn_once!(router = %self.router, "discarding malformed PCP datagram: {e}");
                return Ok(());
            }
        };

        match &response.data {
            OpcodeData::Announce => {
                debug!(epoch = response.epoch_seconds, "router announcement");
                self.observe_epoch(response.epoch_seconds)
            }
            OpcodeData::Map(map) => self.handle_map(&response, map, link_local, now),
            OpcodeData::Peer(peer) => {
                info!(
                    nonce = %peer.map.nonce,
                    result = ?response.result_code,
                    remote = %addr::from_pcp_address(peer.remote_peer_address),
                    remote_port = peer.remote_peer_port,
                    "PEER response"
                );
                Ok(())
            }
        }
    }

    fn handle_map(
        &mut self,
        response: &Response,
        map: &MapData,
        link_local: Option<Ipv6Addr>,
        now: Instant,
    ) -> Result<(), Error> {
        if self.mappings.find_by_nonce(&map.nonce).is_none() {
            warn_once!(nonce = %map.nonce, "ignoring MAP response for a mapping we did not request");
            return Ok(());
        }
        self.observe_epoch(response.epoch_seconds)?;

        if response.result_code != ResultCode::Success {
            if let Some(m) = self.mappings.remove(&map.nonce) {
                warn!(
                    protocol = %m.protocol,
                    internal_port = m.internal.port(),
                    lifetime = response.lifetime_seconds,
                    "gateway refused mapping: {}",
                    response.result_code
                );
            }
            return Ok(());
        }

        let kind = Ipv6Kind::of(&map.external_address);
        if !matches!(kind, Ipv6Kind::Global | Ipv6Kind::Ipv4Mapped) {
            if Some(map.external_address) == link_local {
                warn!(
                    external = %map.external_address,
                    "router returned our own link-local address as the external address, dropping mapping"
                );
            } else {
                warn!(
                    external = %map.external_address,
                    "router returned a {kind} external address, dropping mapping"
                );
            }
            self.mappings.remove(&map.nonce);
            return Ok(());
        }

        if let Some(m) = self.mappings.find_by_nonce_mut(&map.nonce) {
            let external = SocketAddr::new(addr::from_pcp_address(map.external_address), map.external_port);
            m.grant(external, Duration::from_secs(response.lifetime_seconds.into()), now);
            info!(
                protocol = %m.protocol,
                internal = %m.internal,
                %external,
                lifetime = response.lifetime_seconds,
                "mapping granted"
            );
        }
        Ok(())
    }
}

fn send_map(
    transport: &dyn Transport,
    router: SocketAddr,
    client: IpAddr,
    mapping: &PortMapping,
) -> Result<(), Error> {
    let request = Request::map(
        mapping.nonce,
        mapping.protocol,
        client,
        mapping.internal.port(),
        (mapping.external.ip(), mapping.external.port()),
        u32::try_from(mapping.requested_lifetime.as_secs()).unwrap_or(u32::MAX),
    );
    transport
        .send_to(&request.encode(), router)
        .map(|_| ())
        .map_err(|source| Error::Send {
            target: router,
            source,
        })
}

struct InterfaceState {
    config: NetworkInterface,
    v4: Option<FamilyState>,
    v6: Option<FamilyState>,
}

impl InterfaceState {
    fn slot(&mut self, family: Family) -> &mut Option<FamilyState> {
        match family {
            Family::V4 => &mut self.v4,
            Family::V6 => &mut self.v6,
        }
    }

    fn family(&self, family: Family) -> Option<&FamilyState> {
        match family {
            Family::V4 => self.v4.as_ref(),
            Family::V6 => self.v6.as_ref(),
        }
    }
}

struct Session {
    config: ClientConfig,
    network: Box<dyn Network>,
    interfaces: Vec<InterfaceState>,
}

impl Session {
    fn interface(&self, id: InterfaceId) -> Result<&InterfaceState, Error> {
        self.interfaces.get(id.0).ok_or(Error::UnknownInterface(id))
    }

    fn interface_mut(&mut self, id: InterfaceId) -> Result<&mut InterfaceState, Error> {
        self.interfaces.get_mut(id.0).ok_or(Error::UnknownInterface(id))
    }

    /// The running, non-faulted state of a family.
    fn family_mut(&mut self, id: InterfaceId, family: Family) -> Result<&mut FamilyState, Error> {
        self.interface_mut(id)?
            .slot(family)
            .as_mut()
            .filter(|s| !s.faulted)
            .ok_or(Error::NotStarted {
                interface: id,
                family,
            })
    }

    fn open(&self, id: InterfaceId, family: Family, now: Instant) -> Result<FamilyState, Error> {
        let iface = &self.interface(id)?.config;
        let (transport, client_address, router) = match family {
            Family::V4 => {
                let v4 = iface.ipv4.as_ref().ok_or(Error::NoAddress(id, family))?;
                let scope_id = iface.ipv6.as_ref().map_or(0, |c| c.scope_id);
                let transport = self
                    .network
                    .open_listener(self.config.client_port, v4.address, scope_id)?;
                let router = SocketAddr::new(v4.router.into(), self.config.server_port);
                (transport, IpAddr::V4(v4.address), router)
            }
            Family::V6 => {
                let v6 = iface.ipv6.as_ref().ok_or(Error::NoAddress(id, family))?;
                let chosen = v6.closest_to_router().ok_or(Error::NoRouterMatch(id))?;
                let transport = self.network.open_bound(SocketAddrV6::new(
                    chosen,
                    self.config.client_port,
                    0,
                    scope_for(&chosen, v6.scope_id),
                ))?;
                let router = SocketAddrV6::new(
                    v6.router,
                    self.config.server_port,
                    0,
                    scope_for(&v6.router, v6.scope_id),
                );
                (transport, IpAddr::V6(chosen), router.into())
            }
        };
        Ok(FamilyState {
            interface: id,
            family,
            descriptor: transport.descriptor(),
            transport,
            client_address,
            router,
            mappings: MappingTable::new(),
            epoch: None,
            faulted: false,
            last_maintained: now,
        })
    }
}

/// Only link-local addresses need the interface index.
fn scope_for(addr: &Ipv6Addr, scope_id: u32) -> u32 {
    if Ipv6Kind::of(addr) == Ipv6Kind::LinkLocal {
        scope_id
    } else {
        0
    }
}

/// Shared handle to the PCP session. Clones refer to the same session, which
/// lives on the reactor thread.
#[derive(Clone)]
pub struct PcpClient {
    session: Rc<RefCell<Session>>,
}

impl Default for PcpClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl PcpClient {
    /// A client using operating system sockets.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_network(config, SystemNetwork)
    }

    pub fn with_network(config: ClientConfig, network: impl Network + 'static) -> Self {
        Self {
            session: Rc::new(RefCell::new(Session {
                config,
                network: Box::new(network),
                interfaces: Vec::new(),
            })),
        }
    }

    pub fn add_interface(&self, config: NetworkInterface) -> InterfaceId {
        let mut session = self.session.borrow_mut();
        let id = InterfaceId(session.interfaces.len());
        debug!(interface = %id, name = %config.name, "interface added");
        session.interfaces.push(InterfaceState {
            config,
            v4: None,
            v6: None,
        });
        id
    }

    /// Replace an interface's addresses, e.g. after DHCP renumbering.
    /// Running families keep their sockets until restarted.
    /// # Errors
    /// Returns `Error::UnknownInterface` for an id this client did not hand out.
    pub fn update_interface(&self, id: InterfaceId, config: NetworkInterface) -> Result<(), Error> {
        self.session.borrow_mut().interface_mut(id)?.config = config;
        Ok(())
    }

    pub fn is_started(&self, id: InterfaceId, family: Family) -> bool {
        self.session
            .borrow()
            .interface(id)
            .is_ok_and(|i| i.family(family).is_some_and(|s| !s.faulted))
    }

    /// Open the family's socket and register it with `reactor`.
    /// Starting a running family does nothing. A faulted family is reopened.
    /// # Errors
    /// Fails if the interface lacks an address for `family`, if no IPv6
    /// address shares a prefix with the router, or if the socket cannot be
    /// opened or registered.
    pub fn start(&self, reactor: &mut Reactor, id: InterfaceId, family: Family) -> Result<(), Error> {
        let now = Instant::now();
        let (descriptor, timeout_seconds) = {
            let mut session = self.session.borrow_mut();
            let slot = session.interface_mut(id)?.slot(family);
            if let Some(state) = slot.as_ref() {
                if !state.faulted {
                    debug!(interface = %id, %family, "PCP already running");
                    return Ok(());
                }
                reactor.unregister(state.descriptor);
                *slot = None;
            }
            let state = session.open(id, family, now)?;
            let descriptor = state.descriptor;
            *session.interface_mut(id)?.slot(family) = Some(state);
            (descriptor, session.config.timeout_seconds())
        };

        let handler = SocketHandler {
            client: self.clone(),
            interface: id,
            family,
        };
        if let Err(e) = reactor.register(
            descriptor,
            handler,
            Interest::READABLE.with_exceptional(),
            timeout_seconds,
        ) {
            if let Ok(iface) = self.session.borrow_mut().interface_mut(id) {
                *iface.slot(family) = None;
            }
            return Err(e.into());
        }
        info!(interface = %id, %family, %descriptor, "PCP started");
        Ok(())
    }

    /// Ask the family's router for a mapping to `internal_port`.
    /// The mapping is tracked until the router refuses it or the family is stopped.
    /// # Errors
    /// Fails if the family is not running or the request cannot be sent.
    pub fn request_mapping(
        &self,
        id: InterfaceId,
        family: Family,
        protocol: Protocol,
        internal_port: u16,
        external_port: Option<u16>,
        lifetime_seconds: u32,
    ) -> Result<Nonce, Error> {
        let mut session = self.session.borrow_mut();
        let state = session.family_mut(id, family)?;
        let suggested = match family {
            Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let lifetime = Duration::from_secs(lifetime_seconds.into());
        let mapping = PortMapping {
            nonce: Nonce::random(),
            protocol,
            internal: SocketAddr::new(state.client_address, internal_port),
            external: SocketAddr::new(suggested, external_port.unwrap_or(0)),
            requested_lifetime: lifetime,
            lifetime,
            granted_at: Instant::now(),
            expires_at: None,
            state: MappingState::Requested,
            interface: id,
        };
        let nonce = mapping.nonce;
        info!(interface = %id, %family, %protocol, internal_port, %nonce, "requesting mapping");

        let sent = state.send_map(&mapping);
        state.mappings.insert_or_replace(mapping);
        if let Err(e) = &sent {
            state.fault(e);
        }
        sent.map(|()| nonce)
    }

    /// Apply one datagram received on `id`'s sockets.
    /// # Errors
    /// Fails if a renewal triggered by the datagram cannot be sent.
    pub fn on_datagram(&self, id: InterfaceId, bytes: &[u8], source: SocketAddr) -> Result<(), Error> {
        self.on_datagram_at(id, bytes, source, Instant::now())
    }

    /// [`PcpClient::on_datagram`] with an explicit clock.
    /// # Errors
    /// Fails if a renewal triggered by the datagram cannot be sent.
    pub fn on_datagram_at(
        &self,
        id: InterfaceId,
        bytes: &[u8],
        source: SocketAddr,
        now: Instant,
    ) -> Result<(), Error> {
        let mut session = self.session.borrow_mut();
        let server_port = session.config.server_port;
        let iface = session.interface_mut(id)?;

        // Dual-stack sockets report IPv4 senders as IPv4-mapped.
        let source_ip = addr::normalize(source.ip());
        let family = Family::of(&source_ip);
        if source.port() != server_port || iface.config.router(family) != Some(source_ip) {
            warn_once!(interface = %id, %source, "ignoring datagram not sent by the router");
            return Ok(());
        }

        let link_local = iface.config.ipv6.as_ref().map(|c| c.link_local);
        let Some(state) = iface.slot(family).as_mut().filter(|s| !s.faulted) else {
            debug!(interface = %id, %family, "datagram for a family that is not running");
            return Ok(());
        };
        let result = state.handle_datagram(bytes, link_local, now);
        if let Err(e) = &result {
            state.fault(e);
        }
        result
    }

    /// Resend requests for mappings that are pending, expired or close to expiry.
    /// # Errors
    /// Fails if the family is not running or a request cannot be sent.
    pub fn maintain(&self, id: InterfaceId, family: Family) -> Result<(), Error> {
        self.maintain_at(id, family, Instant::now())
    }

    /// [`PcpClient::maintain`] with an explicit clock.
    /// # Errors
    /// Fails if the family is not running or a request cannot be sent.
    pub fn maintain_at(&self, id: InterfaceId, family: Family, now: Instant) -> Result<(), Error> {
        let mut session = self.session.borrow_mut();
        let state = session.family_mut(id, family)?;
        let result = state.maintain(now);
        if let Err(e) = &result {
            state.fault(e);
        }
        result
    }

    /// Unregister and close both sockets of the interface and forget their
    /// mappings. Nothing is sent to the routers.
    /// # Errors
    /// Returns `Error::UnknownInterface` for an id this client did not hand out.
    pub fn stop(&self, reactor: &mut Reactor, id: InterfaceId) -> Result<(), Error> {
        let mut session = self.session.borrow_mut();
        let iface = session.interface_mut(id)?;
        for family in [Family::V4, Family::V6] {
            if let Some(state) = iface.slot(family).take() {
                reactor.unregister(state.descriptor);
                info!(interface = %id, %family, mappings = state.mappings.len(), "PCP stopped");
            }
        }
        Ok(())
    }

    /// Look a mapping up on every interface and family.
    pub fn find_by_nonce(&self, nonce: &Nonce) -> Option<PortMapping> {
        let session = self.session.borrow();
        let found = session
            .interfaces
            .iter()
            .flat_map(|i| [i.v4.as_ref(), i.v6.as_ref()])
            .flatten()
            .find_map(|s| s.mappings.find_by_nonce(nonce).cloned());
        found
    }

    /// Snapshot of a family's mappings, in request order.
    pub fn mappings(&self, id: InterfaceId, family: Family) -> Vec<PortMapping> {
        self.session
            .borrow()
            .interface(id)
            .ok()
            .and_then(|i| i.family(family))
            .map(|s| s.mappings.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn on_ready(
        &self,
        reactor: &mut Reactor,
        id: InterfaceId,
        family: Family,
        descriptor: Descriptor,
        readiness: Readiness,
    ) {
        let now = Instant::now();
        if readiness.readable || readiness.exceptional {
            self.receive(id, family, now);
        }

        let status = {
            let session = self.session.borrow();
            let interval = session.config.maintenance_interval;
            session
                .interface(id)
                .ok()
                .and_then(|i| i.family(family))
                .map(|s| (now.saturating_duration_since(s.last_maintained) >= interval, s.faulted))
        };
        let Some((due, faulted)) = status else {
            reactor.unregister(descriptor);
            return;
        };
        // A busy socket must not starve renewals.
        if (readiness.timed_out || due) && !faulted {
            if let Err(e) = self.maintain_at(id, family, now) {
                debug!(interface = %id, %family, "maintenance failed: {e}");
            }
        }

        let mut session = self.session.borrow_mut();
        if let Ok(iface) = session.interface_mut(id) {
            let slot = iface.slot(family);
            if slot.as_ref().is_some_and(|s| s.faulted) {
                reactor.unregister(descriptor);
                *slot = None;
            }
        }
    }

    fn receive(&self, id: InterfaceId, family: Family, now: Instant) {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let received = {
            let session = self.session.borrow();
            let Some(state) = session.interface(id).ok().and_then(|i| i.family(family)) else {
                return;
            };
            state.transport.recv_from(&mut buf)
        };
        match received {
            Ok((n, source)) => {
                if let Err(e) = self.on_datagram_at(id, &buf[..n], source, now) {
                    debug!(interface = %id, %family, "{e}");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                if let Ok(state) = self.session.borrow_mut().family_mut(id, family) {
                    state.fault(&Error::Receive(e));
                }
            }
        }
    }
}

/// Reactor callback for one family's socket.
struct SocketHandler {
    client: PcpClient,
    interface: InterfaceId,
    family: Family,
}

impl Handler for SocketHandler {
    fn on_ready(&mut self, reactor: &mut Reactor, descriptor: Descriptor, readiness: Readiness) {
        self.client
            .on_ready(reactor, self.interface, self.family, descriptor, readiness);
    }
}
