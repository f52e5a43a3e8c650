//! Diffs the set of addresses visible across the host's live network links
//! into a single deduplicated result set, and republishes that result as
//! `add`/`del` events whenever any link changes.
//!
//! The OS-level host/link enumeration itself is deliberately out of scope
//! here (see `NetHost`/`NetLink` below) — this module only ever consumes
//! it. But the conversion from raw link-layer octets to a classified
//! [`NetAddress`] (spec.md §4.B: "IPv4 → dotted string; IPv6 → canonical
//! string with optional link-scope zone id. Scope is derived from the
//! address octets.") is squarely this component's job, not the link
//! layer's — `NetLink::addresses` only ever hands back raw octets.

use {
  crate::transport::{Family, Locality, NetAddress, Scope},
  async_trait::async_trait,
  std::{
    collections::{HashMap, HashSet},
    net::{Ipv4Addr, Ipv6Addr},
    sync::Arc,
  },
  tokio::sync::{broadcast, mpsc},
  tracing::{debug, warn},
};

/// Opaque identifier for a network link, stable for the link's lifetime.
pub type LinkId = u32;

/// A raw address as reported by a network link, prior to any string
/// rendering or scope classification. `V6`'s second field is the link's own
/// id, carried into the canonical string as a zone id for link-local
/// addresses (e.g. `fe80::1%3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkAddress {
  V4([u8; 4]),
  V6([u8; 16], Option<u32>),
}

/// A single OS network link (e.g. `eth0`), as exposed by [`NetHost`].
#[async_trait]
pub trait NetLink: Send + Sync {
  fn id(&self) -> LinkId;

  /// True only when the link is administratively up *and* carrying
  /// traffic. A link that's merely "up" but not "running" contributes no
  /// addresses, matching how the original only populated a link's address
  /// set when both flags were set.
  fn up_and_running(&self) -> bool;

  /// Raw addresses currently bound to this link. Classification into a
  /// [`NetAddress`] (string rendering + [`Scope`] derivation) happens in
  /// this module, not here.
  fn addresses(&self) -> Vec<LinkAddress>;

  /// The link's own `removed`/`changed`/`involvedChanged` signals. Every
  /// newly-seen link (from the host's initial snapshot or its `linkAdded`
  /// broadcast) is subscribed to this exactly once.
  fn events(&self) -> broadcast::Receiver<LinkEvent>;
}

/// Events a [`NetLink`] can emit over its lifetime.
#[derive(Debug, Clone)]
pub enum LinkEvent {
  Removed,
  Changed,
  InvolvedChanged(bool),
}

/// The OS network host: enumerates existing links and announces new ones.
/// Concrete implementations (reading `/sys/class/net`, netlink sockets,
/// etc.) live outside this crate; it is consumed only through this trait.
#[async_trait]
pub trait NetHost: Send + Sync {
  fn links(&self) -> Vec<Arc<dyn NetLink>>;

  /// Fires once per newly-appeared link. `Arc`, not `Box`: the link is
  /// shared between this broadcast and whatever the host itself keeps
  /// tracking it by.
  fn link_added(&self) -> broadcast::Receiver<Arc<dyn NetLink>>;
}

/// Converts one raw [`LinkAddress`] into a classified [`NetAddress`]:
/// IPv4 renders as a dotted string, IPv6 as its canonical string with an
/// optional `%<linkId>` zone suffix, and [`Scope`] is derived from the
/// address octets per [`classify_v4`]/[`classify_v6`].
fn addr_cnvt(addr: LinkAddress) -> NetAddress {
  match addr {
    LinkAddress::V4(octets) => {
      let ip = Ipv4Addr::from(octets);
      NetAddress {
        scope: Scope::new(Family::Ip4, classify_v4(&ip)),
        value: ip.to_string(),
      }
    }
    LinkAddress::V6(octets, link_id) => {
      let ip = Ipv6Addr::from(octets);
      let mut value = ip.to_string();
      if let Some(id) = link_id {
        value.push('%');
        value.push_str(&id.to_string());
      }
      NetAddress {
        scope: Scope::new(Family::Ip6, classify_v6(&ip)),
        value,
      }
    }
  }
}

/// `host` for loopback, `link` for link-local, `lan` for the private
/// ranges, `wan` for everything else.
fn classify_v4(ip: &Ipv4Addr) -> Locality {
  if ip.is_loopback() {
    Locality::HOST
  } else if ip.is_link_local() {
    Locality::LINK
  } else if ip.is_private() {
    Locality::LAN
  } else {
    Locality::WAN
  }
}

/// Same four buckets as [`classify_v4`], using the IPv6 equivalents:
/// `::1`, `fe80::/10` unicast link-local, and `fc00::/7` unique-local.
fn classify_v6(ip: &Ipv6Addr) -> Locality {
  let first_segment = ip.segments()[0];
  if ip.is_loopback() {
    Locality::HOST
  } else if first_segment & 0xffc0 == 0xfe80 {
    Locality::LINK
  } else if first_segment & 0xfe00 == 0xfc00 {
    Locality::LAN
  } else {
    Locality::WAN
  }
}

/// Diffs enumerated addresses across all live links into one
/// deduplicated result set and republishes additions/removals.
pub struct NetEnumerator {
  link_addresses: HashMap<LinkId, HashSet<NetAddress>>,
  result: HashSet<NetAddress>,
  add_tx: broadcast::Sender<NetAddress>,
  del_tx: broadcast::Sender<NetAddress>,
  failed_tx: mpsc::UnboundedSender<String>,
}

impl NetEnumerator {
  pub fn new(failed_tx: mpsc::UnboundedSender<String>) -> Self {
    let (add_tx, _) = broadcast::channel(256);
    let (del_tx, _) = broadcast::channel(256);
    Self {
      link_addresses: HashMap::new(),
      result: HashSet::new(),
      add_tx,
      del_tx,
      failed_tx,
    }
  }

  pub fn subscribe_add(&self) -> broadcast::Receiver<NetAddress> {
    self.add_tx.subscribe()
  }

  pub fn subscribe_del(&self) -> broadcast::Receiver<NetAddress> {
    self.del_tx.subscribe()
  }

  /// Starts tracking a single newly-seen link, returning a subscription to
  /// its own lifecycle signals for the caller to pump.
  pub fn add_link(&mut self, link: &dyn NetLink) -> (LinkId, broadcast::Receiver<LinkEvent>) {
    self.update_link(link);
    (link.id(), link.events())
  }

  pub fn remove_link(&mut self, id: LinkId) {
    self.link_addresses.remove(&id);
    self.update_result();
  }

  pub fn update_link(&mut self, link: &dyn NetLink) {
    let addrs = if link.up_and_running() {
      link.addresses().into_iter().map(addr_cnvt).collect::<HashSet<_>>()
    } else {
      HashSet::new()
    };
    self.link_addresses.insert(link.id(), addrs);
    self.update_result();
  }

  pub fn handle_link_event(&mut self, link: &dyn NetLink, event: LinkEvent) {
    match event {
      LinkEvent::Removed => self.remove_link(link.id()),
      LinkEvent::Changed | LinkEvent::InvolvedChanged(_) => self.update_link(link),
    }
  }

  pub fn emit_failed(&self, reason: impl Into<String>) {
    let reason = reason.into();
    warn!("net enumerator failure: {reason}");
    let _ = self.failed_tx.send(reason);
  }

  /// Unions every link's address set, diffs it against the previous
  /// result, and publishes every removal before any addition — the order
  /// matters so that a renamed/renumbered address never transiently
  /// appears twice under two different link ids.
  fn update_result(&mut self) {
    let union: HashSet<NetAddress> =
      self.link_addresses.values().flatten().cloned().collect();

    let to_del: Vec<NetAddress> = self.result.difference(&union).cloned().collect();
    let to_add: Vec<NetAddress> = union.difference(&self.result).cloned().collect();

    self.result = union;

    for addr in to_del {
      debug!("net enumerator: address removed: {}", addr.value);
      let _ = self.del_tx.send(addr);
    }
    for addr in to_add {
      debug!("net enumerator: address added: {}", addr.value);
      let _ = self.add_tx.send(addr);
    }
  }

  pub fn current(&self) -> impl Iterator<Item = &NetAddress> {
    self.result.iter()
  }
}
