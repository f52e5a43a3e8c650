//! The node coordinator: owns every other subsystem in this crate and wires
//! their events together the way `original_source/src/node.cpp`'s `Node`
//! does — transport hubs driven by the net enumerator, NAT mappings driven
//! by acceptor starts, session workers driven by inbound channels and by
//! feature `join`/`connect` requests, all funneled through one background
//! event loop task so every shared table (`declared`, `connectionsInProgress`,
//! `joinWaiters`) is mutated from a single place.

use {
  crate::{
    config::ConfigTree,
    error::Result,
    feature::{Agent, Feature, FeatureContext, FeatureService, NodeCommand, NodeEvent},
    key::{parse_key, NodeKey},
    natt::{NattAction, NattCapability, NattManager, NattMappingEvent},
    net_enumerator::{LinkEvent, NetEnumerator, NetHost, NetLink},
    session::{asession_worker, csession_worker, ConnectDeps, ConnectionsInProgress, JoinWaiters},
    task::TaskOwner,
    transport::{
      fix_acceptor_address, fix_connector_address, Acceptor, AcceptorsHi, AcceptorStarted,
      Address, Channel, Connector, ConnectorsHi, Link, NetAddress, PeerId, Remote,
    },
    transport_hub::TransportHub,
  },
  async_trait::async_trait,
  std::{
    collections::HashSet,
    sync::{
      atomic::{AtomicBool, Ordering},
      Arc,
    },
  },
  tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex},
  tracing::{debug, info, warn},
};

/// The replicated-database instance a joined remote is registered with.
/// Deliberately out of scope to implement concretely (see spec.md §1) — the
/// node only ever calls `add_remote`.
#[async_trait]
pub trait RdbSink: Send + Sync {
  async fn add_remote(&self, id: PeerId, remote: Arc<dyn Remote>);
}

/// Digest size [`crate::key::parse_key`] is called with — the default
/// 512-bit Blake2b digest named in spec.md's data model for `NodeKey`.
pub const DEFAULT_KEY_SIZE: usize = 64;

/// Everything the node needs that it does not build itself: the concrete
/// collaborators behind every trait boundary spec.md lists as
/// "deliberately out of scope". Grouped into one struct so `Node::new` has
/// a single, ordered argument instead of a dozen.
pub struct NodeDeps {
  pub link: Arc<dyn Link>,
  pub rdb: Arc<dyn RdbSink>,
  pub net_host: Box<dyn NetHost>,
  pub natt: Option<Box<dyn NattCapability>>,
  pub acceptors_hi: Arc<dyn AcceptorsHi>,
  pub connectors_hi: Arc<dyn ConnectorsHi>,
  pub acceptor_maker: Arc<dyn Fn(&Address) -> Result<Box<dyn Acceptor>> + Send + Sync>,
  pub connector_maker: Arc<dyn Fn(&Address) -> Result<Box<dyn Connector>> + Send + Sync>,
}

fn config_of(root: &ConfigTree, key: &str) -> ConfigTree {
  root.get_child(key).cloned().unwrap_or_default()
}

/// Adapts the connectors hub's composite `Hi` object to the plain
/// `Connector` interface `session.rs`'s `ConnectDeps` expects, since a
/// `ConnectorsHi` trait object can't be reborrowed as `dyn Connector`
/// without this crate's MSRV supporting trait object upcasting.
struct ConnectVia(Arc<dyn ConnectorsHi>);

#[async_trait]
impl Connector for ConnectVia {
  async fn connect(&self, addr: &Address) -> Result<Box<dyn Channel>> {
    self.0.connect(addr).await
  }

  fn subscribe_involved_changed(&self) -> tokio::sync::broadcast::Receiver<bool> {
    self.0.subscribe_involved_changed()
  }
}

/// Peer node runtime. Owns the transport hubs, session bookkeeping, NAT
/// manager, net enumerator and feature service; routes their events to one
/// another per spec.md §4.F/§5.
pub struct Node {
  key: NodeKey,
  connect_config: ConfigTree,
  accept_config: ConfigTree,
  link: Arc<dyn Link>,
  rdb: Arc<dyn RdbSink>,
  net_host: Box<dyn NetHost>,
  natt_capability: Option<Box<dyn NattCapability>>,
  acceptors_hi: Arc<dyn AcceptorsHi>,
  connectors_hi: Arc<dyn ConnectorsHi>,
  acceptor_maker: Arc<dyn Fn(&Address) -> Result<Box<dyn Acceptor>> + Send + Sync>,
  connector_maker: Arc<dyn Fn(&Address) -> Result<Box<dyn Connector>> + Send + Sync>,
  feature_service: Arc<AsyncMutex<FeatureService>>,
  feature_ctx: FeatureContext,
  feature_commands_rx: Option<mpsc::UnboundedReceiver<NodeCommand>>,
  declared: Arc<parking_lot::Mutex<HashSet<Address>>>,
  connections_in_progress: Arc<ConnectionsInProgress>,
  join_waiters: Arc<JoinWaiters>,
  started: Arc<AtomicBool>,
  tow: Arc<TaskOwner>,
}

impl Node {
  /// Derives the node's key from `config`'s `key` subtree and builds the
  /// node without starting anything (no sockets, no enumerator, no
  /// features initialized) — mirrors the original separating construction
  /// from `Node::start`.
  pub fn new(config: &ConfigTree, deps: NodeDeps) -> Result<Self> {
    let key = parse_key(&config_of(config, "key"), DEFAULT_KEY_SIZE)?;
    let started = Arc::new(AtomicBool::new(false));
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let feature_service = Arc::new(AsyncMutex::new(FeatureService::new(started.clone())));
    let feature_ctx = FeatureContext::new(commands_tx, started.clone());

    Ok(Self {
      key,
      connect_config: config_of(config, "connect"),
      accept_config: config_of(config, "accept"),
      link: deps.link,
      rdb: deps.rdb,
      net_host: deps.net_host,
      natt_capability: deps.natt,
      acceptors_hi: deps.acceptors_hi,
      connectors_hi: deps.connectors_hi,
      acceptor_maker: deps.acceptor_maker,
      connector_maker: deps.connector_maker,
      feature_service,
      feature_ctx,
      feature_commands_rx: Some(commands_rx),
      declared: Arc::new(parking_lot::Mutex::new(HashSet::new())),
      connections_in_progress: Arc::new(ConnectionsInProgress::new()),
      join_waiters: Arc::new(JoinWaiters::new()),
      started,
      tow: Arc::new(TaskOwner::new()),
    })
  }

  pub fn key(&self) -> &NodeKey {
    &self.key
  }

  pub fn is_started(&self) -> bool {
    self.started.load(Ordering::SeqCst)
  }

  pub fn declared_addresses(&self) -> Vec<Address> {
    self.declared.lock().iter().cloned().collect()
  }

  pub async fn register_feature(&self, feature: Box<dyn Feature>) {
    self.feature_service.lock().await.register(feature);
  }

  pub fn feature_context(&self) -> FeatureContext {
    self.feature_ctx.clone()
  }

  pub async fn subscribe_feature_events(&self) -> broadcast::Receiver<NodeEvent> {
    self.feature_service.lock().await.subscribe()
  }

  /// Start sequence per spec.md §4.F: bind feature-service callbacks,
  /// instantiate features, start the connectors hub, start the acceptors
  /// hub, create the NAT capability's mappings as acceptors come up, start
  /// the net enumerator, flip `started`, start the feature service,
  /// finally start the acceptors' hi-level listener.
  pub async fn start(&mut self, features: Vec<Box<dyn Feature>>) -> Result<()> {
    for feature in features {
      self.feature_service.lock().await.register(feature);
    }

    let connector_maker = self.connector_maker.clone();
    let mut connectors = TransportHub::new(
      self.connectors_hi.clone(),
      fix_connector_address,
      move |addr: &Address| -> Result<Box<dyn Connector>> { connector_maker(addr) },
    );
    let connector_lo_added_rx = connectors.subscribe_lo_added();
    let connector_lo_deleted_rx = connectors.subscribe_lo_deleted();
    connectors.start(&self.connect_config)?;

    let acceptor_maker = self.acceptor_maker.clone();
    let mut acceptors = TransportHub::new(
      self.acceptors_hi.clone(),
      fix_acceptor_address,
      move |addr: &Address| -> Result<Box<dyn Acceptor>> { acceptor_maker(addr) },
    );
    let acceptor_lo_deleted_rx = acceptors.subscribe_lo_deleted();
    acceptors.start(&self.accept_config)?;

    // Subscribed before `acceptors_hi.start()` below actually begins
    // listening, mirroring `original_source/src/node.cpp`'s own ordering
    // (`ah->started()`/`ah->accepted()` are wired before `_acceptors.hi()->start()`)
    // so no early `started`/inbound-channel event can race past an
    // as-yet-unsubscribed receiver.
    let started_rx = self.acceptors_hi.subscribe_started();
    let channels_rx = self.acceptors_hi.take_channels();

    let mut net_enumerator = NetEnumerator::new({
      let (tx, mut rx) = mpsc::unbounded_channel::<String>();
      let feature_service = self.feature_service.clone();
      self.tow.spawn(async move {
        while let Some(reason) = rx.recv().await {
          feature_service.lock().await.failed(reason);
        }
      });
      tx
    });

    // Subscribed before the host's initial link set is added below, for the
    // same reason as the hub subscriptions above: `add_link` publishes
    // synchronously, and a link present at construction must not have its
    // addresses lost to a not-yet-existing subscriber.
    let add_rx = net_enumerator.subscribe_add();
    let del_rx = net_enumerator.subscribe_del();

    let (link_events_tx, link_events_rx) = mpsc::unbounded_channel::<(Arc<dyn NetLink>, LinkEvent)>();
    for link in self.net_host.links() {
      let (_, rx) = net_enumerator.add_link(link.as_ref());
      spawn_link_forwarder(&self.tow, link, rx, link_events_tx.clone());
    }
    let link_added_rx = self.net_host.link_added();

    self.started.store(true, Ordering::SeqCst);
    self.feature_service.lock().await.start(self.feature_ctx.clone()).await?;
    self.acceptors_hi.start().await;
    info!("node started with key {:?}", self.key);

    self.run_event_loop(
      connectors,
      acceptors,
      net_enumerator,
      link_events_tx,
      link_events_rx,
      link_added_rx,
      add_rx,
      del_rx,
      connector_lo_added_rx,
      connector_lo_deleted_rx,
      acceptor_lo_deleted_rx,
      started_rx,
      channels_rx,
    );
    Ok(())
  }

  /// Spawns the single background task that owns every mutable table and
  /// drives all cross-subsystem wiring. Kept as one task so the ordering
  /// guarantees in spec.md §5 hold without extra synchronization between
  /// collaborators.
  fn run_event_loop(
    &mut self,
    mut connectors: TransportHub<Arc<dyn ConnectorsHi>, Box<dyn Connector>>,
    mut acceptors: TransportHub<Arc<dyn AcceptorsHi>, Box<dyn Acceptor>>,
    mut net_enumerator: NetEnumerator,
    link_events_tx: mpsc::UnboundedSender<(Arc<dyn NetLink>, LinkEvent)>,
    mut link_events_rx: mpsc::UnboundedReceiver<(Arc<dyn NetLink>, LinkEvent)>,
    mut link_added_rx: broadcast::Receiver<Arc<dyn NetLink>>,
    mut add_rx: broadcast::Receiver<NetAddress>,
    mut del_rx: broadcast::Receiver<NetAddress>,
    mut connector_lo_added_rx: broadcast::Receiver<Address>,
    mut connector_lo_deleted_rx: broadcast::Receiver<Address>,
    mut acceptor_lo_deleted_rx: broadcast::Receiver<Address>,
    mut started_rx: broadcast::Receiver<AcceptorStarted>,
    mut channels_rx: mpsc::UnboundedReceiver<Box<dyn Channel>>,
  ) {
    let mut connectors_involved_lost_rx = connectors.take_involved_lost();
    let mut acceptors_involved_lost_rx = acceptors.take_involved_lost();
    let mut commands_rx = self
      .feature_commands_rx
      .take()
      .expect("Node::start called more than once");

    let (natt_tx, mut natt_rx) = mpsc::unbounded_channel::<(Address, NattMappingEvent)>();
    let mut natt_manager = self.natt_capability.take().map(NattManager::new);

    let declared = self.declared.clone();
    let feature_service = self.feature_service.clone();
    let join_waiters = self.join_waiters.clone();
    let token = self.tow.token();
    let connector_deps = ConnectDeps {
      connector: Arc::new(ConnectVia(self.connectors_hi.clone())),
      link: self.link.clone(),
      connections_in_progress: self.connections_in_progress.clone(),
      join_waiters: join_waiters.clone(),
      token: token.clone(),
    };
    let link = self.link.clone();
    let rdb = self.rdb.clone();
    let tow = self.tow.clone();
    let started = self.started.clone();

    self.tow.spawn(async move {
      loop {
        tokio::select! {
          _ = token.cancelled() => {
            debug!("node event loop: stop requested");
            break;
          }

          Some(addr) = recv_any(&mut add_rx) => {
            if let Err(e) = connectors.handle_enumerator_add(&addr) {
              warn!("connectors hub: {e}");
            }
            if let Err(e) = acceptors.handle_enumerator_add(&addr) {
              warn!("acceptors hub: {e}");
              feature_service.lock().await.acceptor_failed(e.to_string());
            }
          }

          Some(addr) = recv_any(&mut del_rx) => {
            if let Err(e) = connectors.handle_enumerator_del(&addr) {
              warn!("connectors hub: {e}");
            }
            if let Err(e) = acceptors.handle_enumerator_del(&addr) {
              warn!("acceptors hub: {e}");
              feature_service.lock().await.acceptor_failed(e.to_string());
            }
          }

          Some(addr) = recv_any(&mut connector_lo_added_rx) => {
            feature_service.lock().await.connector_started(addr);
          }

          Some(addr) = recv_any(&mut connector_lo_deleted_rx) => {
            feature_service.lock().await.connector_stopped(addr);
          }

          Some(addr) = recv_any(&mut acceptor_lo_deleted_rx) => {
            feature_service.lock().await.acceptor_stopped(addr);
          }

          Some(net_link) = recv_any(&mut link_added_rx) => {
            let (_, rx) = net_enumerator.add_link(net_link.as_ref());
            spawn_link_forwarder(&tow, net_link, rx, link_events_tx.clone());
          }

          Some((net_link, event)) = link_events_rx.recv() => {
            net_enumerator.handle_link_event(net_link.as_ref(), event);
          }

          Some(started_evt) = recv_any(&mut started_rx) => {
            feature_service.lock().await.acceptor_started(
              started_evt.internal.clone(),
              started_evt.external.clone(),
            );
            declared.lock().insert(started_evt.external.clone());
            feature_service.lock().await.declared(started_evt.external.clone());

            if let Some(manager) = natt_manager.as_mut() {
              match manager.create(started_evt.internal.clone()).await {
                Ok(mut events) => {
                  let internal = started_evt.internal.clone();
                  let natt_tx = natt_tx.clone();
                  tow.spawn(async move {
                    while let Ok(event) = events.recv().await {
                      if natt_tx.send((internal.clone(), event)).is_err() {
                        break;
                      }
                    }
                  });
                }
                Err(e) => warn!("natt: unable to start mapping for {}: {e}", started_evt.internal),
              }
            }
          }

          Some(channel) = channels_rx.recv() => {
            let link = link.clone();
            let rdb = rdb.clone();
            let feature_service = feature_service.clone();
            let worker_token = token.clone();
            tow.spawn(async move {
              let fs_for_new = feature_service.clone();
              asession_worker(
                link.as_ref(),
                channel,
                &worker_token,
                move |session| {
                  let fs = fs_for_new.clone();
                  let session = session.clone();
                  tokio::spawn(async move { fs.lock().await.new_session(session) });
                },
                move |id, remote| {
                  tokio::spawn(async move { rdb.add_remote(id, remote).await });
                },
              )
              .await;
            });
          }

          Some((internal, event)) = natt_rx.recv() => {
            if let Some(manager) = natt_manager.as_mut() {
              for action in manager.handle_event(&internal, event) {
                apply_natt_action(action, &declared, &feature_service).await;
              }
            }
          }

          Some(addr) = connectors_involved_lost_rx.recv() => {
            connectors.force_del_lo(&addr);
          }

          Some(addr) = acceptors_involved_lost_rx.recv() => {
            acceptors.force_del_lo(&addr);
          }

          Some(cmd) = commands_rx.recv() => {
            handle_command(
              cmd,
              &connector_deps,
              &join_waiters,
              &declared,
              &feature_service,
              &tow,
            ).await;
          }
        }
      }

      // Stop sequence, reverse of start: tear down NAT mappings first (so
      // their undeclares land before the hubs they depend on disappear),
      // then the bookkeeping tables, then the feature service, then the
      // hubs themselves.
      started.store(false, Ordering::SeqCst);
      if let Some(mut manager) = natt_manager {
        for action in manager.clear().await {
          apply_natt_action(action, &declared, &feature_service).await;
        }
      }
      join_waiters.flush_all_err("node stopped");
      feature_service.lock().await.stop();
      connectors.stop();
      acceptors.stop();
    });
  }

  /// Stop sequence: cancels the event loop and waits for every task this
  /// node ever spawned (event loop, session workers, link/natt forwarders)
  /// to actually finish. Idempotent.
  pub async fn stop(&mut self) {
    self.tow.flush().await;
  }
}

async fn apply_natt_action(
  action: NattAction,
  declared: &Arc<parking_lot::Mutex<HashSet<Address>>>,
  feature_service: &Arc<AsyncMutex<FeatureService>>,
) {
  match action {
    NattAction::Declare(addr) => {
      declared.lock().insert(addr.clone());
      feature_service.lock().await.declared(addr);
    }
    NattAction::Undeclare(addr) => {
      declared.lock().remove(&addr);
      feature_service.lock().await.undeclared(addr);
    }
  }
}

async fn handle_command(
  cmd: NodeCommand,
  connector_deps: &ConnectDeps,
  join_waiters: &Arc<JoinWaiters>,
  declared: &Arc<parking_lot::Mutex<HashSet<Address>>>,
  feature_service: &Arc<AsyncMutex<FeatureService>>,
  tow: &Arc<TaskOwner>,
) {
  match cmd {
    NodeCommand::Join(addr, tx) => {
      join_waiters.register(addr.clone(), tx);
      let deps = connector_deps.clone();
      tow.spawn(async move {
        csession_worker(deps, None, addr, |_session| {}, |_id, _remote| {}).await;
      });
    }
    NodeCommand::Connect(addr, expected_id) => {
      let deps = connector_deps.clone();
      tow.spawn(async move {
        csession_worker(deps, expected_id, addr, |_session| {}, |_id, _remote| {}).await;
      });
    }
    NodeCommand::FireDiscovered(addr) => {
      feature_service.lock().await.discovered(addr);
    }
    NodeCommand::Declare(addr) => {
      declared.lock().insert(addr.clone());
      feature_service.lock().await.declared(addr);
    }
    NodeCommand::Undeclare(addr) => {
      declared.lock().remove(&addr);
      feature_service.lock().await.undeclared(addr);
    }
    NodeCommand::GetDeclared(tx) => {
      let addrs = declared.lock().iter().cloned().collect();
      let _ = tx.send(addrs);
    }
    NodeCommand::RegisterAgentProvider(name, agent) => {
      feature_service.lock().await.register_agent_provider(name, agent);
    }
    NodeCommand::GetAgent(name, tx) => {
      let agent: Option<Agent> = feature_service.lock().await.get_agent(&name);
      let _ = tx.send(agent);
    }
  }
}

fn spawn_link_forwarder(
  tow: &TaskOwner,
  link: Arc<dyn NetLink>,
  mut rx: broadcast::Receiver<LinkEvent>,
  tx: mpsc::UnboundedSender<(Arc<dyn NetLink>, LinkEvent)>,
) {
  tow.spawn(async move {
    while let Ok(event) = rx.recv().await {
      if tx.send((link.clone(), event)).is_err() {
        break;
      }
    }
  });
}

/// Thin helper so a `tokio::select!` arm reading from a `broadcast`
/// receiver degrades to "skip this poll" on a lag/close error instead of
/// panicking the whole event loop over one missed or re-sent event.
async fn recv_any<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Option<T> {
  rx.recv().await.ok()
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::{
      error::Error,
      natt::NattMappingApi,
      net_enumerator::{LinkAddress, LinkId},
      transport_hub::Hi,
    },
    std::time::Duration,
  };

  struct FakeHostLink {
    link_id: LinkId,
    addrs: Vec<LinkAddress>,
    _events_tx: broadcast::Sender<LinkEvent>,
  }

  impl FakeHostLink {
    fn new(link_id: LinkId, addrs: Vec<LinkAddress>) -> Arc<dyn NetLink> {
      let (events_tx, _) = broadcast::channel(4);
      Arc::new(Self { link_id, addrs, _events_tx: events_tx })
    }
  }

  #[async_trait]
  impl NetLink for FakeHostLink {
    fn id(&self) -> LinkId {
      self.link_id
    }
    fn up_and_running(&self) -> bool {
      true
    }
    fn addresses(&self) -> Vec<LinkAddress> {
      self.addrs.clone()
    }
    fn events(&self) -> broadcast::Receiver<LinkEvent> {
      self._events_tx.subscribe()
    }
  }

  /// Keeps its `link_added` sender alive for the node's whole lifetime:
  /// a dropped sender would make `link_added_rx.recv()` resolve `Err`
  /// immediately on every poll, spinning the event loop.
  struct FakeNetHost {
    links: Vec<Arc<dyn NetLink>>,
    _link_added_tx: broadcast::Sender<Arc<dyn NetLink>>,
  }

  impl FakeNetHost {
    fn new(links: Vec<Arc<dyn NetLink>>) -> Self {
      let (link_added_tx, _) = broadcast::channel(4);
      Self { links, _link_added_tx: link_added_tx }
    }
  }

  #[async_trait]
  impl NetHost for FakeNetHost {
    fn links(&self) -> Vec<Arc<dyn NetLink>> {
      self.links.clone()
    }
    fn link_added(&self) -> broadcast::Receiver<Arc<dyn NetLink>> {
      self._link_added_tx.subscribe()
    }
  }

  struct FakeAcceptorLo;

  #[async_trait]
  impl Acceptor for FakeAcceptorLo {
    fn is_involved(&self) -> bool {
      true
    }
    fn subscribe_involved_changed(&self) -> broadcast::Receiver<bool> {
      broadcast::channel(1).1
    }
  }

  struct FakeConnectorLo;

  #[async_trait]
  impl Connector for FakeConnectorLo {
    async fn connect(&self, addr: &Address) -> Result<Box<dyn Channel>> {
      Err(Error::Connect { addr: addr.to_string(), reason: "not supported in test".into() })
    }
    fn subscribe_involved_changed(&self) -> broadcast::Receiver<bool> {
      broadcast::channel(1).1
    }
  }

  /// Stands in for a real hi-level acceptor listener. `fire_started` lets a
  /// test trigger an `AcceptorStarted` event at a known point, after
  /// `Node::start` has returned and its subscription is guaranteed to be in
  /// place (see the ordering fix above `started_rx` is taken from in
  /// `Node::start`).
  struct FakeAcceptorsHi {
    started_tx: broadcast::Sender<AcceptorStarted>,
    _channels_tx: mpsc::UnboundedSender<Box<dyn Channel>>,
    channels_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Box<dyn Channel>>>>,
  }

  impl FakeAcceptorsHi {
    fn new() -> Arc<Self> {
      let (started_tx, _) = broadcast::channel(16);
      let (channels_tx, channels_rx) = mpsc::unbounded_channel();
      Arc::new(Self {
        started_tx,
        _channels_tx: channels_tx,
        channels_rx: parking_lot::Mutex::new(Some(channels_rx)),
      })
    }

    fn fire_started(&self, internal: Address, external: Address) {
      let _ = self.started_tx.send(AcceptorStarted { internal, external });
    }
  }

  impl Hi<Box<dyn Acceptor>> for FakeAcceptorsHi {
    fn add(&self, _lo: &Box<dyn Acceptor>) {}
    fn del(&self, _lo: &Box<dyn Acceptor>) {}
  }

  #[async_trait]
  impl AcceptorsHi for FakeAcceptorsHi {
    async fn start(&self) {}

    fn subscribe_started(&self) -> broadcast::Receiver<AcceptorStarted> {
      self.started_tx.subscribe()
    }

    fn take_channels(&self) -> mpsc::UnboundedReceiver<Box<dyn Channel>> {
      self.channels_rx.lock().take().expect("take_channels called more than once")
    }
  }

  struct FakeConnectorsHi;

  #[async_trait]
  impl Connector for FakeConnectorsHi {
    async fn connect(&self, addr: &Address) -> Result<Box<dyn Channel>> {
      Err(Error::Connect { addr: addr.to_string(), reason: "not supported in test".into() })
    }
    fn subscribe_involved_changed(&self) -> broadcast::Receiver<bool> {
      broadcast::channel(1).1
    }
  }

  impl Hi<Box<dyn Connector>> for FakeConnectorsHi {
    fn add(&self, _lo: &Box<dyn Connector>) {}
    fn del(&self, _lo: &Box<dyn Connector>) {}
  }

  struct FakeSessionLink;

  #[async_trait]
  impl Link for FakeSessionLink {
    async fn join_by_connect(&self, _channel: Box<dyn Channel>) -> Result<Box<dyn Remote>> {
      Err(Error::feature("not supported in test"))
    }
    async fn join_by_accept(&self, _channel: Box<dyn Channel>) -> Result<Box<dyn Remote>> {
      Err(Error::feature("not supported in test"))
    }
  }

  struct FakeRdbSink;

  #[async_trait]
  impl RdbSink for FakeRdbSink {
    async fn add_remote(&self, _id: PeerId, _remote: Arc<dyn Remote>) {}
  }

  struct FakeNattMapping {
    tx: broadcast::Sender<NattMappingEvent>,
  }

  #[async_trait]
  impl NattMappingApi for FakeNattMapping {
    fn events(&self) -> broadcast::Receiver<NattMappingEvent> {
      self.tx.subscribe()
    }
    async fn stop(&self) {}
  }

  struct FakeNattCapability {
    tx: broadcast::Sender<NattMappingEvent>,
  }

  #[async_trait]
  impl NattCapability for FakeNattCapability {
    async fn create_mapping(&self, _internal: Address) -> Result<Box<dyn NattMappingApi>> {
      Ok(Box::new(FakeNattMapping { tx: self.tx.clone() }))
    }
  }

  fn accept_only_ip4(port: &str) -> ConfigTree {
    let mut conf = ConfigTree::new();
    conf.push_child("inproc", ConfigTree::leaf("false"));
    conf.push_child("local", ConfigTree::leaf("false"));
    conf.push_child("ip6", ConfigTree::leaf("false"));
    let mut ip4 = ConfigTree::new();
    ip4.push_child("port", ConfigTree::leaf(port));
    conf.push_child("ip4", ip4);
    conf
  }

  fn no_connectors() -> ConfigTree {
    let mut conf = ConfigTree::new();
    conf.push_child("inproc", ConfigTree::leaf("false"));
    conf.push_child("local", ConfigTree::leaf("false"));
    conf.push_child("ip4", ConfigTree::leaf("false"));
    conf.push_child("ip6", ConfigTree::leaf("false"));
    conf
  }

  fn base_deps(
    net_host: FakeNetHost,
    acceptors_hi: Arc<FakeAcceptorsHi>,
    natt: Option<Box<dyn NattCapability>>,
  ) -> NodeDeps {
    NodeDeps {
      link: Arc::new(FakeSessionLink),
      rdb: Arc::new(FakeRdbSink),
      net_host: Box::new(net_host),
      natt,
      acceptors_hi,
      connectors_hi: Arc::new(FakeConnectorsHi),
      acceptor_maker: Arc::new(|_addr: &Address| -> Result<Box<dyn Acceptor>> {
        Ok(Box::new(FakeAcceptorLo))
      }),
      connector_maker: Arc::new(|_addr: &Address| -> Result<Box<dyn Connector>> {
        Ok(Box::new(FakeConnectorLo))
      }),
    }
  }

  async fn recv_event(rx: &mut broadcast::Receiver<NodeEvent>) -> NodeEvent {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
      .await
      .expect("timed out waiting for a feature event")
      .expect("feature event channel closed")
  }

  /// Seed scenario 1: a host with a single IPv4 link binds an ip4 acceptor
  /// on the configured port; once the (fake) transport layer reports that
  /// bind as started, the node must declare the bound address and surface
  /// both the `acceptorStarted` and `declared` feature events.
  #[tokio::test]
  async fn accept_on_enumerated_link_declares_its_bound_address() {
    let link = FakeHostLink::new(1, vec![LinkAddress::V4([192, 0, 2, 5])]);
    let net_host = FakeNetHost::new(vec![link]);
    let acceptors_hi = FakeAcceptorsHi::new();

    let mut root = ConfigTree::new();
    root.push_child("key", ConfigTree::leaf("constant"));
    root.push_child("accept", accept_only_ip4("7000"));
    root.push_child("connect", no_connectors());

    let deps = base_deps(net_host, acceptors_hi.clone(), None);
    let mut node = Node::new(&root, deps).unwrap();
    let mut events = node.subscribe_feature_events().await;

    node.start(Vec::new()).await.unwrap();

    let addr = Address::new("tcp4://192.0.2.5:7000");
    acceptors_hi.fire_started(addr.clone(), addr.clone());

    let started = recv_event(&mut events).await;
    assert!(
      matches!(&started, NodeEvent::AcceptorStarted { internal, external }
        if *internal == addr && *external == addr),
      "expected AcceptorStarted({addr}, {addr}), got {started:?}"
    );

    let declared = recv_event(&mut events).await;
    assert!(
      matches!(&declared, NodeEvent::Declared(a) if *a == addr),
      "expected Declared({addr}), got {declared:?}"
    );

    assert_eq!(node.declared_addresses(), vec![addr]);

    node.stop().await;
  }

  /// Seed scenario 4: an acceptor's NAT mapping is established, then
  /// re-established at a different external address. The declared set
  /// must track the mapping's current external address exactly, undeclaring
  /// the superseded one as soon as the new one is declared.
  #[tokio::test]
  async fn natt_remapping_undeclares_the_superseded_external_address() {
    let net_host = FakeNetHost::new(Vec::new());
    let acceptors_hi = FakeAcceptorsHi::new();
    let (natt_tx, _) = broadcast::channel::<NattMappingEvent>(8);
    let natt: Box<dyn NattCapability> = Box::new(FakeNattCapability { tx: natt_tx.clone() });

    let mut root = ConfigTree::new();
    root.push_child("key", ConfigTree::leaf("constant"));
    root.push_child("accept", accept_only_ip4("0"));
    root.push_child("connect", no_connectors());

    let deps = base_deps(net_host, acceptors_hi.clone(), Some(natt));
    let mut node = Node::new(&root, deps).unwrap();
    let mut events = node.subscribe_feature_events().await;

    node.start(Vec::new()).await.unwrap();

    let internal = Address::new("tcp4://0.0.0.0:0");
    acceptors_hi.fire_started(internal.clone(), internal.clone());

    assert!(matches!(recv_event(&mut events).await, NodeEvent::AcceptorStarted { .. }));
    let declared = recv_event(&mut events).await;
    assert!(matches!(&declared, NodeEvent::Declared(a) if *a == internal));

    let external_a = Address::new("tcp4://198.51.100.1:9000");
    let _ = natt_tx.send(NattMappingEvent::Established(external_a.clone()));
    let declared = recv_event(&mut events).await;
    assert!(matches!(&declared, NodeEvent::Declared(a) if *a == external_a));

    let mut declared_set = node.declared_addresses();
    declared_set.sort();
    let mut expected = vec![internal.clone(), external_a.clone()];
    expected.sort();
    assert_eq!(declared_set, expected);

    let external_b = Address::new("tcp4://198.51.100.2:9000");
    let _ = natt_tx.send(NattMappingEvent::Established(external_b.clone()));

    let undeclared = recv_event(&mut events).await;
    assert!(matches!(&undeclared, NodeEvent::Undeclared(a) if *a == external_a));
    let declared = recv_event(&mut events).await;
    assert!(matches!(&declared, NodeEvent::Declared(a) if *a == external_b));

    let mut declared_set = node.declared_addresses();
    declared_set.sort();
    let mut expected = vec![internal.clone(), external_b.clone()];
    expected.sort();
    assert_eq!(declared_set, expected);

    node.stop().await;
  }
}
