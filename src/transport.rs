//! Address/scope data model and the transport capability traits.
//!
//! `Address`, `Scope` and `NetAddress` are the node's own vocabulary for
//! describing where to listen and where peers live; `Acceptor`,
//! `Connector` and `Channel` are the capability boundary below which a
//! concrete transport (TCP, local sockets, in-process pipes, ...) lives.
//! The node only ever calls through these traits — it never knows what is
//! on the other side.

use {
  crate::error::Result,
  async_trait::async_trait,
  rand::Rng,
  std::fmt,
};

/// Address family. A closed two-variant field: the `neither ip4 nor ip6`
/// branch the original filter code had to defensively handle is not
/// representable here, so there is nothing to reach at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Family {
  Ip4,
  Ip6,
}

/// Locality bits, combinable with `|`. Used both on a concrete
/// [`NetAddress`] (exactly one bit set) and as a hub's configured filter
/// (any combination of bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Locality(u8);

impl Locality {
  pub const HOST: Locality = Locality(1 << 0);
  pub const LINK: Locality = Locality(1 << 1);
  pub const LAN: Locality = Locality(1 << 2);
  pub const WAN: Locality = Locality(1 << 3);
  pub const NONE: Locality = Locality(0);

  pub fn contains(self, bit: Locality) -> bool {
    self.0 & bit.0 != 0
  }
}

impl std::ops::BitOr for Locality {
  type Output = Locality;
  fn bitor(self, rhs: Locality) -> Locality {
    Locality(self.0 | rhs.0)
  }
}

/// Combined family + locality scope of a network address, as produced by
/// the enumerator and consumed by the transport hub's address filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Scope {
  pub family: Family,
  pub locality: Locality,
}

impl Scope {
  pub fn new(family: Family, locality: Locality) -> Self {
    Self { family, locality }
  }
}

/// An address enumerated from a live network link: a scope plus its
/// textual value (an IP literal, with link id suffix for link-local
/// addresses). Totally ordered by `(scope, value)` so enumerator diffs
/// are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetAddress {
  pub scope: Scope,
  pub value: String,
}

/// A URL-shaped address string, e.g. `tcp4://0.0.0.0:9000`,
/// `local://%auto%`, `inproc://%auto%`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(String);

impl Address {
  pub fn new(s: impl Into<String>) -> Self {
    Self(s.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// The scheme portion before `://`, or the whole string if there's no
  /// separator.
  pub fn scheme(&self) -> &str {
    self.0.split("://").next().unwrap_or(&self.0)
  }
}

impl fmt::Display for Address {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<String> for Address {
  fn from(s: String) -> Self {
    Self(s)
  }
}

impl From<&str> for Address {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

const AUTO_PLACEHOLDER: &str = "%auto%";

/// Replaces the first occurrence of the literal `%auto%` substring with
/// `repl`. Not a templating engine: only the first occurrence is touched,
/// and an address with no placeholder is returned unchanged.
pub fn fix_auto(src: &str, repl: &str) -> String {
  match src.find(AUTO_PLACEHOLDER) {
    Some(pos) => {
      let mut out = String::with_capacity(src.len() - AUTO_PLACEHOLDER.len() + repl.len());
      out.push_str(&src[..pos]);
      out.push_str(repl);
      out.push_str(&src[pos + AUTO_PLACEHOLDER.len()..]);
      out
    }
    None => src.to_string(),
  }
}

/// Generates a random name of `chars` characters drawn from `a..x`
/// (every byte is reduced mod 24 before being offset from `'a'`).
pub fn mk_random_name(chars: usize) -> String {
  let mut rng = rand::thread_rng();
  (0..chars)
    .map(|_| (b'a' + rng.gen::<u8>() % 24) as char)
    .collect()
}

/// Rewrites an acceptor-side address's `%auto%` placeholder into a
/// scheme-appropriate unique local name.
pub fn fix_acceptor_address(addr: Address) -> Address {
  match addr.scheme() {
    "local" => {
      let name = format!("dci-ppn-node-{}.sock", mk_random_name(32));
      Address::new(fix_auto(addr.as_str(), &name))
    }
    "inproc" => {
      let name = mk_random_name(32);
      Address::new(fix_auto(addr.as_str(), &name))
    }
    _ => addr,
  }
}

/// Rewrites a connector-side address's `%auto%` placeholder into the
/// empty string (the connector never needs to name itself).
pub fn fix_connector_address(addr: Address) -> Address {
  Address::new(fix_auto(addr.as_str(), ""))
}

/// A single authenticated, ordered byte-stream to a remote peer. Produced
/// by [`Acceptor::accept`] or [`Connector::connect`] and handed to a
/// [`Link`] to become a joined [`crate::session::Session`].
#[async_trait]
pub trait Channel: Send + Sync {
  /// The address of the remote endpoint of this channel, as seen locally.
  fn remote_address(&self) -> Address;

  async fn close(&self);
}

/// A capability object's reference-health signal: `false` means the object
/// is no longer in use and should be torn down, per spec.md's glossary
/// entry for "Involved". [`crate::transport_hub::TransportHub`] subscribes
/// to this on every `Lo` it constructs so an endpoint that declares itself
/// uninvolved is removed even while its use counter is still positive.
pub trait Involved {
  /// A receiver of this object's `involvedChanged` transitions. A hub
  /// subscribes once, at construction, and tears the endpoint down the
  /// first time it observes `false`.
  fn subscribe_involved_changed(&self) -> tokio::sync::broadcast::Receiver<bool>;
}

/// Listens on a local address and hands off inbound channels. Implemented
/// by a concrete transport (TCP, UNIX socket, in-process pipe); the node
/// only ever holds a `Box<dyn Acceptor>` behind a [`crate::transport_hub::TransportHub`].
#[async_trait]
pub trait Acceptor: Send + Sync {
  /// True once this acceptor's own `involvedChanged(false)` condition has
  /// fired, i.e. it can no longer produce new inbound channels.
  fn is_involved(&self) -> bool;

  /// Subscribes to this acceptor's own `involvedChanged` transitions.
  fn subscribe_involved_changed(&self) -> tokio::sync::broadcast::Receiver<bool>;
}

/// Dials out to a remote address, producing a [`Channel`] on success.
#[async_trait]
pub trait Connector: Send + Sync {
  async fn connect(&self, addr: &Address) -> Result<Box<dyn Channel>>;

  /// Subscribes to this connector's own `involvedChanged` transitions.
  fn subscribe_involved_changed(&self) -> tokio::sync::broadcast::Receiver<bool>;
}

impl Involved for Box<dyn Acceptor> {
  fn subscribe_involved_changed(&self) -> tokio::sync::broadcast::Receiver<bool> {
    (**self).subscribe_involved_changed()
  }
}

impl Involved for Box<dyn Connector> {
  fn subscribe_involved_changed(&self) -> tokio::sync::broadcast::Receiver<bool> {
    (**self).subscribe_involved_changed()
  }
}

/// Peer identity as produced by the link layer once a channel has
/// completed its handshake. Opaque to everything above the link.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(pub Vec<u8>);

/// A joined, identity-bearing remote endpoint. What `Link::join_by_connect`
/// / `Link::join_by_accept` hand back once a [`Channel`] has been
/// authenticated.
#[async_trait]
pub trait Remote: Send + Sync {
  fn id(&self) -> PeerId;

  /// Resolves once the underlying link is closed, for either side.
  async fn closed(&self);
}

/// The link layer: turns a raw [`Channel`] into an identity-bearing
/// [`Remote`] via a cryptographic handshake. Deliberately out of scope to
/// implement concretely — the node only consumes it.
#[async_trait]
pub trait Link: Send + Sync {
  async fn join_by_connect(&self, channel: Box<dyn Channel>) -> Result<Box<dyn Remote>>;
  async fn join_by_accept(&self, channel: Box<dyn Channel>) -> Result<Box<dyn Remote>>;
}

/// One acceptor's address finishing its bind: `internal` is the configured
/// address (post `%auto%` expansion), `external` is the address it
/// actually bound to (relevant when a port of `0` let the OS pick one).
/// Declaring `external` locally and kicking off a NAT mapping attempt for
/// `internal` both key off this event.
#[derive(Debug, Clone)]
pub struct AcceptorStarted {
  pub internal: Address,
  pub external: Address,
}

/// The composite, hi-level object the acceptors [`crate::transport_hub::TransportHub`]
/// plugs individual [`Acceptor`]s into and out of. Besides the ref-counted
/// `add`/`del` it shares with every hub, it is itself the thing that
/// actually starts listening (once every configured `Lo` has been added)
/// and the source of inbound channels.
#[async_trait]
pub trait AcceptorsHi: crate::transport_hub::Hi<Box<dyn Acceptor>> + Send + Sync {
  async fn start(&self);

  fn subscribe_started(&self) -> tokio::sync::broadcast::Receiver<AcceptorStarted>;

  /// Hands over the channel of freshly accepted inbound connections. A raw
  /// `Box<dyn Channel>` can't ride a `broadcast` channel (it isn't
  /// `Clone` — accepting it twice makes no sense), so this is an `mpsc`
  /// receiver meant to be taken exactly once, by the node's own event loop.
  fn take_channels(&self) -> tokio::sync::mpsc::UnboundedReceiver<Box<dyn Channel>>;
}

/// The composite, hi-level object the connectors
/// [`crate::transport_hub::TransportHub`] plugs individual [`Connector`]s
/// into and out of. It is itself a [`Connector`]: `csession_worker` dials
/// through `connectors.hi()` directly, not through any individual bound
/// `Lo`.
pub trait ConnectorsHi: Connector + crate::transport_hub::Hi<Box<dyn Connector>> + Send + Sync {}

impl<T> ConnectorsHi for T where T: Connector + crate::transport_hub::Hi<Box<dyn Connector>> + Send + Sync {}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fix_auto_replaces_first_occurrence_only() {
    let out = fix_auto("local://%auto%/%auto%", "x");
    assert_eq!(out, "local://x/%auto%");
  }

  #[test]
  fn fix_auto_is_noop_without_placeholder() {
    let out = fix_auto("tcp4://0.0.0.0:9000", "x");
    assert_eq!(out, "tcp4://0.0.0.0:9000");
  }

  #[test]
  fn mk_random_name_only_uses_a_through_x() {
    let name = mk_random_name(256);
    assert_eq!(name.len(), 256);
    assert!(name.chars().all(|c| ('a'..='x').contains(&c)));
  }

  #[test]
  fn fix_acceptor_address_local_scheme() {
    let addr = fix_acceptor_address(Address::new("local://%auto%"));
    assert!(addr.as_str().starts_with("local://dci-ppn-node-"));
    assert!(addr.as_str().ends_with(".sock"));
  }

  #[test]
  fn fix_acceptor_address_inproc_scheme() {
    let addr = fix_acceptor_address(Address::new("inproc://%auto%"));
    assert!(addr.as_str().starts_with("inproc://"));
    assert!(!addr.as_str().contains("%auto%"));
  }

  #[test]
  fn fix_connector_address_clears_placeholder() {
    let addr = fix_connector_address(Address::new("local://%auto%"));
    assert_eq!(addr.as_str(), "local://");
  }

  #[test]
  fn net_address_orders_by_scope_then_value() {
    let a = NetAddress {
      scope: Scope::new(Family::Ip4, Locality::LAN),
      value: "10.0.0.1".into(),
    };
    let b = NetAddress {
      scope: Scope::new(Family::Ip4, Locality::WAN),
      value: "1.1.1.1".into(),
    };
    assert!(a < b, "LAN (lower locality bit) should sort before WAN");
  }
}
