//! Feature service surface: the boundary between pluggable features
//! (instantiated per `features.<name>` config subtree) and the node
//! capabilities they're allowed to drive — join, connect, declare local
//! addresses, discover peers, and observe sessions.
//!
//! Features never hold a reference to the node directly; they're handed a
//! cheaply-clonable [`FeatureContext`] that forwards requests back to the
//! node's own command loop, the same command-channel shape the node uses
//! internally for its other collaborators.

use {
  crate::{
    error::{Error, Result},
    session::{JoinResult, Session},
    transport::{Address, PeerId, Remote},
  },
  async_trait::async_trait,
  std::{
    any::Any,
    collections::HashMap,
    sync::{
      atomic::{AtomicBool, Ordering},
      Arc,
    },
  },
  tokio::sync::{broadcast, mpsc, oneshot},
  tracing::debug,
};

/// Opaque, type-erased capability some feature exposes for other features
/// to discover by name (the original's `registerAgentProvider`/`getAgent`
/// surface). Kept intentionally minimal: this crate's spec doesn't define
/// what an "agent" looks like beyond it being a named, looked-up
/// capability, so it's modeled as `Any` rather than a fixed interface.
pub type Agent = Arc<dyn Any + Send + Sync>;

/// Requests a feature can make of the node that owns it.
pub enum NodeCommand {
  Join(Address, oneshot::Sender<JoinResult>),
  Connect(Address, Option<PeerId>),
  FireDiscovered(Address),
  Declare(Address),
  Undeclare(Address),
  GetDeclared(oneshot::Sender<Vec<Address>>),
  RegisterAgentProvider(String, Agent),
  GetAgent(String, oneshot::Sender<Option<Agent>>),
}

impl std::fmt::Debug for NodeCommand {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Join(a, _) => write!(f, "Join({a})"),
      Self::Connect(a, id) => write!(f, "Connect({a}, {id:?})"),
      Self::FireDiscovered(a) => write!(f, "FireDiscovered({a})"),
      Self::Declare(a) => write!(f, "Declare({a})"),
      Self::Undeclare(a) => write!(f, "Undeclare({a})"),
      Self::GetDeclared(_) => write!(f, "GetDeclared"),
      Self::RegisterAgentProvider(name, _) => write!(f, "RegisterAgentProvider({name})"),
      Self::GetAgent(name, _) => write!(f, "GetAgent({name})"),
    }
  }
}

/// Cheap, clonable handle a feature uses to talk back to the node.
#[derive(Clone)]
pub struct FeatureContext {
  commands: mpsc::UnboundedSender<NodeCommand>,
  started: Arc<AtomicBool>,
}

impl FeatureContext {
  pub fn new(commands: mpsc::UnboundedSender<NodeCommand>, started: Arc<AtomicBool>) -> Self {
    Self { commands, started }
  }

  /// Requests a join to `addr`, sharing an in-flight connect to the same
  /// address with any other concurrent caller. Resolves with the joined
  /// [`Remote`] or the error that ended the attempt.
  pub async fn join(&self, addr: Address) -> Result<Arc<dyn Remote>> {
    let (tx, rx) = oneshot::channel();
    self
      .commands
      .send(NodeCommand::Join(addr, tx))
      .map_err(|_| Error::feature("node stopped"))?;
    rx.await
      .map_err(|_| Error::feature("node stopped"))?
      .map_err(Error::Join)
  }

  pub fn connect(&self, addr: Address, id: Option<PeerId>) {
    let _ = self.commands.send(NodeCommand::Connect(addr, id));
  }

  pub fn fire_discovered(&self, addr: Address) {
    let _ = self.commands.send(NodeCommand::FireDiscovered(addr));
  }

  pub fn declare(&self, addr: Address) {
    let _ = self.commands.send(NodeCommand::Declare(addr));
  }

  pub fn undeclare(&self, addr: Address) {
    let _ = self.commands.send(NodeCommand::Undeclare(addr));
  }

  pub async fn get_declared(&self) -> Vec<Address> {
    let (tx, rx) = oneshot::channel();
    if self.commands.send(NodeCommand::GetDeclared(tx)).is_err() {
      return Vec::new();
    }
    rx.await.unwrap_or_default()
  }

  pub fn register_agent_provider(&self, name: impl Into<String>, agent: Agent) {
    let _ = self.commands.send(NodeCommand::RegisterAgentProvider(name.into(), agent));
  }

  pub async fn get_agent(&self, name: impl Into<String>) -> Option<Agent> {
    let (tx, rx) = oneshot::channel();
    if self.commands.send(NodeCommand::GetAgent(name.into(), tx)).is_err() {
      return None;
    }
    rx.await.ok().flatten()
  }

  pub fn started(&self) -> bool {
    self.started.load(Ordering::SeqCst)
  }
}

/// A pluggable unit of node behavior. Instantiated once per
/// `features.<name>` config subtree and wired into the node's command
/// loop at start.
#[async_trait]
pub trait Feature: Send + Sync {
  fn name(&self) -> &str;

  async fn init(&mut self, ctx: FeatureContext) -> Result<()>;
}

/// Events the feature service fans out to every registered feature. The
/// full outbound surface named in spec.md §4.G/§6:
/// `connectorStarted/Stopped`, `acceptorStarted/Stopped/Failed`,
/// `declared/undeclared`, `newSession`, `discovered`, `failed`.
#[derive(Debug, Clone)]
pub enum NodeEvent {
  ConnectorStarted(Address),
  ConnectorStopped(Address),
  AcceptorStarted { internal: Address, external: Address },
  AcceptorStopped(Address),
  AcceptorFailed(String),
  Declared(Address),
  Undeclared(Address),
  Discovered(Address),
  Failed(String),
  NewSession(Session),
}

/// Owns the set of instantiated features and the event fan-out to them.
/// Shares its `started` flag with every [`FeatureContext`] it hands out, so
/// a feature's `ctx.started()` and the service's own gating of
/// `declared`/`undeclared`/`failed` always agree.
pub struct FeatureService {
  features: Vec<Box<dyn Feature>>,
  events_tx: broadcast::Sender<NodeEvent>,
  agents: HashMap<String, Agent>,
  started: Arc<AtomicBool>,
}

impl FeatureService {
  pub fn new(started: Arc<AtomicBool>) -> Self {
    let (events_tx, _) = broadcast::channel(256);
    Self {
      features: Vec::new(),
      events_tx,
      agents: HashMap::new(),
      started,
    }
  }

  pub fn started_flag(&self) -> Arc<AtomicBool> {
    self.started.clone()
  }

  pub fn register(&mut self, feature: Box<dyn Feature>) {
    self.features.push(feature);
  }

  pub fn register_agent_provider(&mut self, name: impl Into<String>, agent: Agent) {
    self.agents.insert(name.into(), agent);
  }

  pub fn get_agent(&self, name: &str) -> Option<Agent> {
    self.agents.get(name).cloned()
  }

  pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
    self.events_tx.subscribe()
  }

  /// Initializes every registered feature in registration order. On the
  /// first failure, wraps it with the feature's own name (mirrors
  /// `"unable to initialize feature '<name>'"`) and stops — features
  /// already initialized stay initialized, matching the original's
  /// best-effort startup.
  pub async fn start(&mut self, ctx: FeatureContext) -> Result<()> {
    for feature in &mut self.features {
      feature.init(ctx.clone()).await.map_err(|e| {
        Error::feature(format!("unable to initialize feature '{}': {e}", feature.name()))
      })?;
    }
    self.started.store(true, Ordering::SeqCst);
    debug!("feature service started with {} feature(s)", self.features.len());
    Ok(())
  }

  pub fn stop(&mut self) {
    self.started.store(false, Ordering::SeqCst);
    self.features.clear();
    self.agents.clear();
  }

  pub fn is_started(&self) -> bool {
    self.started.load(Ordering::SeqCst)
  }

  /// Emission of these events is gated on `started`, mirroring the
  /// original's `if (_started) featureService->declared(...)` guards — a
  /// node that hasn't finished starting, or has already started
  /// stopping, never surfaces address-lifecycle noise to features.
  pub fn declared(&self, addr: Address) {
    if self.is_started() {
      let _ = self.events_tx.send(NodeEvent::Declared(addr));
    }
  }

  pub fn undeclared(&self, addr: Address) {
    if self.is_started() {
      let _ = self.events_tx.send(NodeEvent::Undeclared(addr));
    }
  }

  pub fn connector_started(&self, addr: Address) {
    if self.is_started() {
      let _ = self.events_tx.send(NodeEvent::ConnectorStarted(addr));
    }
  }

  pub fn connector_stopped(&self, addr: Address) {
    if self.is_started() {
      let _ = self.events_tx.send(NodeEvent::ConnectorStopped(addr));
    }
  }

  pub fn acceptor_started(&self, internal: Address, external: Address) {
    if self.is_started() {
      let _ = self.events_tx.send(NodeEvent::AcceptorStarted { internal, external });
    }
  }

  pub fn acceptor_stopped(&self, addr: Address) {
    if self.is_started() {
      let _ = self.events_tx.send(NodeEvent::AcceptorStopped(addr));
    }
  }

  pub fn acceptor_failed(&self, reason: impl Into<String>) {
    if self.is_started() {
      let _ = self.events_tx.send(NodeEvent::AcceptorFailed(reason.into()));
    }
  }

  pub fn discovered(&self, addr: Address) {
    if self.is_started() {
      let _ = self.events_tx.send(NodeEvent::Discovered(addr));
    }
  }

  pub fn failed(&self, reason: impl Into<String>) {
    if self.is_started() {
      let _ = self.events_tx.send(NodeEvent::Failed(reason.into()));
    }
  }

  /// Published unconditionally, even before the node finishes starting —
  /// sessions can be in flight (e.g. an inbound connection racing
  /// startup) regardless of `_started`.
  pub fn new_session(&self, session: Session) {
    let _ = self.events_tx.send(NodeEvent::NewSession(session));
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct NoopFeature(&'static str);

  #[async_trait]
  impl Feature for NoopFeature {
    fn name(&self) -> &str {
      self.0
    }
    async fn init(&mut self, _ctx: FeatureContext) -> Result<()> {
      Ok(())
    }
  }

  struct FailingFeature;

  #[async_trait]
  impl Feature for FailingFeature {
    fn name(&self) -> &str {
      "failing"
    }
    async fn init(&mut self, _ctx: FeatureContext) -> Result<()> {
      Err(Error::feature("boom"))
    }
  }

  fn new_service() -> FeatureService {
    FeatureService::new(Arc::new(AtomicBool::new(false)))
  }

  fn ctx(service: &FeatureService) -> FeatureContext {
    let (tx, _rx) = mpsc::unbounded_channel();
    FeatureContext::new(tx, service.started_flag())
  }

  #[tokio::test]
  async fn events_are_suppressed_before_start() {
    let service = new_service();
    let mut rx = service.subscribe();
    service.declared(Address::new("tcp4://1.2.3.4:9000"));
    assert!(rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn events_flow_once_started() {
    let mut service = new_service();
    service.register(Box::new(NoopFeature("a")));
    let ctx = ctx(&service);
    service.start(ctx).await.unwrap();

    let mut rx = service.subscribe();
    service.declared(Address::new("tcp4://1.2.3.4:9000"));
    assert!(matches!(rx.recv().await.unwrap(), NodeEvent::Declared(_)));
  }

  #[tokio::test]
  async fn failing_feature_init_names_itself_in_the_error() {
    let mut service = new_service();
    service.register(Box::new(FailingFeature));
    let ctx = ctx(&service);
    let err = service.start(ctx).await.unwrap_err();
    assert!(err.to_string().contains("failing"));
  }

  #[tokio::test]
  async fn agent_registry_roundtrips_by_name() {
    let mut service = new_service();
    service.register_agent_provider("rdb", Arc::new(42_u32));
    let agent = service.get_agent("rdb").unwrap();
    assert_eq!(*agent.downcast::<u32>().unwrap(), 42);
  }

  #[tokio::test]
  async fn context_started_reflects_the_shared_flag() {
    let mut service = new_service();
    let ctx = ctx(&service);
    assert!(!ctx.started());
    service.start(ctx.clone()).await.unwrap();
    assert!(ctx.started());
  }
}
