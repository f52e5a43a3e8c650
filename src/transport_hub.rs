//! Generic ref-counted multiplexer over a set of local addresses.
//!
//! A `TransportHub<Hi, Lo>` is configured once (some addresses fixed in
//! config, some auto-derived from enabled transports, some driven live by
//! the network enumerator) and from then on owns exactly one `Lo` per
//! distinct [`Address`], shared by however many config entries or
//! enumerator hits asked for it. `Hi` is the acceptor/connector-level
//! object the hub plugs each `Lo` into and out of as the ref count goes
//! to and from zero.
//!
//! Monomorphized twice by `node.rs`: once for the acceptors hub (`Hi` =
//! the node's inbound multiplexer, `Lo` = a single bound `Acceptor`) and
//! once for the connectors hub (`Lo` = a single `Connector`).

use {
  crate::{
    config::{parse_bool, parse_uint16, ConfigTree},
    error::{Error, Result},
    transport::{Address, Family, Involved, Locality, NetAddress},
  },
  metrics::gauge,
  std::collections::BTreeMap,
  tokio::sync::{broadcast, mpsc},
  tracing::{debug, warn},
};

/// The hi-level object a hub plugs bound `Lo` instances into and out of.
/// `start`/`stop` default to no-ops: a connectors hub never needs them, an
/// acceptors hub overrides `start` to begin actually listening once every
/// configured `Lo` has been added (the last step of `Node::start`).
pub trait Hi<Lo> {
  fn add(&self, lo: &Lo);
  fn del(&self, lo: &Lo);
}

impl<H, Lo> Hi<Lo> for Box<H>
where
  H: Hi<Lo> + ?Sized,
{
  fn add(&self, lo: &Lo) {
    (**self).add(lo)
  }
  fn del(&self, lo: &Lo) {
    (**self).del(lo)
  }
}

/// Lets a hub be built over a reference-counted composite `Hi`, so the same
/// object can also be held directly (e.g. by session workers dialing
/// through `connectors.hi()`) without fighting the hub for ownership.
impl<H, Lo> Hi<Lo> for std::sync::Arc<H>
where
  H: Hi<Lo> + ?Sized,
{
  fn add(&self, lo: &Lo) {
    (**self).add(lo)
  }
  fn del(&self, lo: &Lo) {
    (**self).del(lo)
  }
}

struct LoInstance<Lo> {
  use_counter: usize,
  lo: Option<Lo>,
}

struct IpFilter {
  family: Family,
  port: Option<u16>,
  scopes: Locality,
}

impl IpFilter {
  fn matches(&self, addr: &NetAddress) -> bool {
    addr.scope.family == self.family && addr.scope.locality.contains(self.scopes)
  }

  fn format(&self, value: &str) -> Address {
    let port = self.port.map(|p| format!(":{p}")).unwrap_or_default();
    match self.family {
      Family::Ip4 => Address::new(format!("tcp4://{value}{port}")),
      Family::Ip6 => Address::new(format!("tcp6://[{value}]{port}")),
    }
  }
}

pub struct TransportHub<H, Lo> {
  hi: H,
  address_fixer: Box<dyn Fn(Address) -> Address + Send + Sync>,
  lo_maker: Box<dyn Fn(&Address) -> Result<Lo> + Send + Sync>,
  lo_instances: BTreeMap<Address, LoInstance<Lo>>,
  ip_filters: Vec<IpFilter>,
  lo_added_tx: broadcast::Sender<Address>,
  lo_deleted_tx: broadcast::Sender<Address>,
  involved_lost_tx: mpsc::UnboundedSender<Address>,
  involved_lost_rx: Option<mpsc::UnboundedReceiver<Address>>,
}

impl<H, Lo> TransportHub<H, Lo>
where
  H: Hi<Lo>,
  Lo: Involved,
{
  pub fn new(
    hi: H,
    address_fixer: impl Fn(Address) -> Address + Send + Sync + 'static,
    lo_maker: impl Fn(&Address) -> Result<Lo> + Send + Sync + 'static,
  ) -> Self {
    let (lo_added_tx, _) = broadcast::channel(64);
    let (lo_deleted_tx, _) = broadcast::channel(64);
    let (involved_lost_tx, involved_lost_rx) = mpsc::unbounded_channel();
    Self {
      hi,
      address_fixer: Box::new(address_fixer),
      lo_maker: Box::new(lo_maker),
      lo_instances: BTreeMap::new(),
      ip_filters: Vec::new(),
      lo_added_tx,
      lo_deleted_tx,
      involved_lost_tx,
      involved_lost_rx: Some(involved_lost_rx),
    }
  }

  /// Takes the receiver side of this hub's `involvedChanged(false)` event
  /// stream: one address per bound `Lo` that has declared itself no longer
  /// involved, to be fed back into [`Self::del_lo`] by the caller (the
  /// node's single event loop, mirroring spec.md §4.C). Consumed exactly
  /// once.
  pub fn take_involved_lost(&mut self) -> mpsc::UnboundedReceiver<Address> {
    self.involved_lost_rx.take().expect("take_involved_lost called more than once")
  }

  pub fn hi(&self) -> &H {
    &self.hi
  }

  pub fn subscribe_lo_added(&self) -> broadcast::Receiver<Address> {
    self.lo_added_tx.subscribe()
  }

  pub fn subscribe_lo_deleted(&self) -> broadcast::Receiver<Address> {
    self.lo_deleted_tx.subscribe()
  }

  /// Applies config-driven auto-configuration, then binds every explicit
  /// `custom` address entry.
  pub fn start(&mut self, conf: &ConfigTree) -> Result<()> {
    self.auto_conf(conf)?;
    for custom in conf.equal_range("custom") {
      let value = custom.value_or_empty();
      if !value.contains("://") {
        return Err(Error::config(format!("bad address value in config: {value}")));
      }
      self.add_lo(Address::new(value))?;
    }
    Ok(())
  }

  pub fn stop(&mut self) {
    self.ip_filters.clear();
    let addrs: Vec<Address> = self.lo_instances.keys().cloned().collect();
    for addr in addrs {
      if let Some(instance) = self.lo_instances.remove(&addr) {
        if let Some(lo) = &instance.lo {
          self.hi.del(lo);
          let _ = self.lo_deleted_tx.send(addr);
        }
      }
    }
  }

  fn auto_conf(&mut self, conf: &ConfigTree) -> Result<()> {
    if parse_bool(&conf.get("inproc", "true"))? {
      let addr = (self.address_fixer)(Address::new("inproc://%auto%"));
      self.add_lo(addr)?;
    }
    if parse_bool(&conf.get("local", "true"))? {
      let addr = (self.address_fixer)(Address::new("local://%auto%"));
      self.add_lo(addr)?;
    }
    if parse_bool(&conf.get("ip4", "true"))? {
      let empty = ConfigTree::new();
      self.auto_conf_ip(conf.get_child("ip4").unwrap_or(&empty), Family::Ip4)?;
    }
    if parse_bool(&conf.get("ip6", "true"))? {
      let empty = ConfigTree::new();
      self.auto_conf_ip(conf.get_child("ip6").unwrap_or(&empty), Family::Ip6)?;
    }
    Ok(())
  }

  fn auto_conf_ip(&mut self, conf: &ConfigTree, family: Family) -> Result<()> {
    let port_str = conf.get("port", "");
    let port = if port_str.is_empty() {
      None
    } else {
      Some(parse_uint16(&port_str)?)
    };

    let mut scopes = Locality::NONE;
    if parse_bool(&conf.get("host", "true"))? {
      scopes = scopes | Locality::HOST;
    }
    if parse_bool(&conf.get("link", "true"))? {
      scopes = scopes | Locality::LINK;
    }
    if parse_bool(&conf.get("lan", "true"))? {
      scopes = scopes | Locality::LAN;
    }
    if parse_bool(&conf.get("wan", "true"))? {
      scopes = scopes | Locality::WAN;
    }

    self.ip_filters.push(IpFilter { family, port, scopes });
    Ok(())
  }

  /// Forwards an enumerator `add` event through every filter configured
  /// on this hub (at most one filter will match a given address's
  /// family).
  pub fn handle_enumerator_add(&mut self, addr: &NetAddress) -> Result<()> {
    let formatted: Vec<Address> = self
      .ip_filters
      .iter()
      .filter(|f| f.matches(addr))
      .map(|f| f.format(&addr.value))
      .collect();
    for a in formatted {
      self.add_lo(a)?;
    }
    Ok(())
  }

  pub fn handle_enumerator_del(&mut self, addr: &NetAddress) -> Result<()> {
    let formatted: Vec<Address> = self
      .ip_filters
      .iter()
      .filter(|f| f.matches(addr))
      .map(|f| f.format(&addr.value))
      .collect();
    for a in formatted {
      self.del_lo(a)?;
    }
    Ok(())
  }

  /// Binds `a`, constructing a fresh `Lo` only on the first reference;
  /// every subsequent call for the same address just bumps the use
  /// counter.
  pub fn add_lo(&mut self, a: Address) -> Result<()> {
    let instance = self.lo_instances.entry(a.clone()).or_insert(LoInstance {
      use_counter: 0,
      lo: None,
    });
    instance.use_counter += 1;

    if instance.lo.is_none() {
      let lo = (self.lo_maker)(&a).map_err(|e| Error::TransportBind {
        addr: a.to_string(),
        reason: e.to_string(),
      })?;
      self.hi.add(&lo);
      debug!("transport hub: bound address {a}");

      let mut involved_rx = lo.subscribe_involved_changed();
      let involved_lost_tx = self.involved_lost_tx.clone();
      let watched_addr = a.clone();
      tokio::spawn(async move {
        while let Ok(involved) = involved_rx.recv().await {
          if !involved {
            let _ = involved_lost_tx.send(watched_addr);
            break;
          }
        }
      });

      instance.lo = Some(lo);
      let _ = self.lo_added_tx.send(a);
      gauge!("transport_hub_bound_addresses", self.lo_instances.len() as f64);
    }
    Ok(())
  }

  /// Unbinds one reference to `a`; only tears down the underlying `Lo`
  /// once the use counter reaches zero.
  pub fn del_lo(&mut self, a: Address) -> Result<()> {
    let Some(instance) = self.lo_instances.get_mut(&a) else {
      warn!("transport hub: del_lo on unknown address {a}");
      return Ok(());
    };

    debug_assert!(instance.use_counter > 0);
    instance.use_counter = instance.use_counter.saturating_sub(1);

    if instance.use_counter > 0 {
      return Ok(());
    }

    if let Some(lo) = &instance.lo {
      self.hi.del(lo);
      debug!("transport hub: unbound address {a}");
      let _ = self.lo_deleted_tx.send(a.clone());
    }
    self.lo_instances.remove(&a);
    gauge!("transport_hub_bound_addresses", self.lo_instances.len() as f64);
    Ok(())
  }

  /// Tears `a` down unconditionally, regardless of its use counter: the
  /// response to the `Lo`'s own `involvedChanged(false)` firing, which per
  /// spec.md §3 destroys the endpoint no matter how many sources still
  /// reference the address.
  pub fn force_del_lo(&mut self, a: &Address) {
    let Some(instance) = self.lo_instances.remove(a) else {
      return;
    };
    if let Some(lo) = &instance.lo {
      self.hi.del(lo);
      debug!("transport hub: {a} no longer involved, unbound");
      let _ = self.lo_deleted_tx.send(a.clone());
    }
    gauge!("transport_hub_bound_addresses", self.lo_instances.len() as f64);
  }

  pub fn bound_addresses(&self) -> impl Iterator<Item = &Address> {
    self.lo_instances.keys()
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::transport::Scope,
    std::sync::{Arc, Mutex},
  };

  #[derive(Clone)]
  struct FakeLo(String);

  impl Involved for FakeLo {
    fn subscribe_involved_changed(&self) -> broadcast::Receiver<bool> {
      broadcast::channel(1).1
    }
  }

  struct RecordingHi(Arc<Mutex<Vec<String>>>);
  impl Hi<FakeLo> for RecordingHi {
    fn add(&self, lo: &FakeLo) {
      self.0.lock().unwrap().push(format!("add:{}", lo.0));
    }
    fn del(&self, lo: &FakeLo) {
      self.0.lock().unwrap().push(format!("del:{}", lo.0));
    }
  }

  fn make_hub() -> (TransportHub<RecordingHi, FakeLo>, Arc<Mutex<Vec<String>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let hub = TransportHub::new(
      RecordingHi(log.clone()),
      |a| a,
      |a| Ok(FakeLo(a.to_string())),
    );
    (hub, log)
  }

  struct ControllableLo(broadcast::Sender<bool>);
  impl Involved for ControllableLo {
    fn subscribe_involved_changed(&self) -> broadcast::Receiver<bool> {
      self.0.subscribe()
    }
  }

  #[tokio::test]
  async fn ref_counts_shared_address_and_only_binds_once() {
    let (mut hub, log) = make_hub();
    hub.add_lo(Address::new("tcp4://0.0.0.0:9000")).unwrap();
    hub.add_lo(Address::new("tcp4://0.0.0.0:9000")).unwrap();
    assert_eq!(log.lock().unwrap().as_slice(), &["add:tcp4://0.0.0.0:9000"]);

    hub.del_lo(Address::new("tcp4://0.0.0.0:9000")).unwrap();
    assert_eq!(log.lock().unwrap().len(), 1, "still referenced once, not torn down");

    hub.del_lo(Address::new("tcp4://0.0.0.0:9000")).unwrap();
    assert_eq!(
      log.lock().unwrap().as_slice(),
      &["add:tcp4://0.0.0.0:9000", "del:tcp4://0.0.0.0:9000"]
    );
  }

  #[tokio::test]
  async fn involved_changed_false_tears_down_endpoint_even_with_outstanding_refs() {
    struct RecordingHi2(Arc<Mutex<Vec<String>>>);
    impl Hi<ControllableLo> for RecordingHi2 {
      fn add(&self, _lo: &ControllableLo) {
        self.0.lock().unwrap().push("add".into());
      }
      fn del(&self, _lo: &ControllableLo) {
        self.0.lock().unwrap().push("del".into());
      }
    }

    let log = Arc::new(Mutex::new(Vec::new()));
    let (involved_tx, _) = broadcast::channel(4);
    let involved_tx_for_maker = involved_tx.clone();
    let mut hub: TransportHub<RecordingHi2, ControllableLo> = TransportHub::new(
      RecordingHi2(log.clone()),
      |a| a,
      move |_a| Ok(ControllableLo(involved_tx_for_maker.clone())),
    );
    let mut lost_rx = hub.take_involved_lost();
    let addr = Address::new("tcp4://0.0.0.0:9000");

    // Two independent sources reference the same address.
    hub.add_lo(addr.clone()).unwrap();
    hub.add_lo(addr.clone()).unwrap();
    assert_eq!(log.lock().unwrap().as_slice(), &["add"]);

    let _ = involved_tx.send(false);
    let reported = lost_rx.recv().await.unwrap();
    assert_eq!(reported, addr);
    hub.force_del_lo(&reported);

    assert_eq!(
      log.lock().unwrap().as_slice(),
      &["add", "del"],
      "involvedChanged(false) tears the endpoint down despite a use counter of 2"
    );
    assert_eq!(hub.bound_addresses().count(), 0);
  }

  #[tokio::test]
  async fn stop_tears_down_every_bound_address() {
    let (mut hub, log) = make_hub();
    hub.add_lo(Address::new("inproc://a")).unwrap();
    hub.add_lo(Address::new("local://b")).unwrap();
    hub.stop();
    assert_eq!(log.lock().unwrap().len(), 4);
    assert_eq!(hub.bound_addresses().count(), 0);
  }

  #[tokio::test]
  async fn bad_custom_address_is_rejected() {
    let (mut hub, _log) = make_hub();
    let mut conf = ConfigTree::new();
    conf.push_child("inproc", ConfigTree::leaf("false"));
    conf.push_child("local", ConfigTree::leaf("false"));
    conf.push_child("ip4", ConfigTree::leaf("false"));
    conf.push_child("ip6", ConfigTree::leaf("false"));
    conf.push_child("custom", ConfigTree::leaf("not-a-url"));
    assert!(hub.start(&conf).is_err());
  }

  #[tokio::test]
  async fn ip_filter_only_matches_configured_family_and_scope() {
    let (mut hub, log) = make_hub();
    let mut ip4 = ConfigTree::new();
    ip4.push_child("lan", ConfigTree::leaf("true"));
    ip4.push_child("wan", ConfigTree::leaf("false"));
    ip4.push_child("host", ConfigTree::leaf("false"));
    ip4.push_child("link", ConfigTree::leaf("false"));
    hub.auto_conf_ip(&ip4, Family::Ip4).unwrap();

    let lan_addr = NetAddress {
      scope: Scope::new(Family::Ip4, Locality::LAN),
      value: "10.0.0.5".into(),
    };
    let wan_addr = NetAddress {
      scope: Scope::new(Family::Ip4, Locality::WAN),
      value: "1.1.1.1".into(),
    };
    hub.handle_enumerator_add(&lan_addr).unwrap();
    hub.handle_enumerator_add(&wan_addr).unwrap();

    assert_eq!(log.lock().unwrap().as_slice(), &["add:tcp4://10.0.0.5"]);
  }
}
