//! Session workers: the per-connection tasks that turn a raw channel into
//! a joined, identity-bearing remote, on both the connect side and the
//! accept side.
//!
//! Mirrors the original's `csessionWorker`/`asessionWorker` pair closely:
//! duplicate-connect suppression, a join-waiters multimap so multiple
//! callers asking to join the same address share one in-flight attempt,
//! and the same failure/close fan-out ordering.

use {
  crate::{
    error::{Error, Result},
    task::cancellable,
    transport::{Address, Channel, Connector, Link, PeerId, Remote},
  },
  async_trait::async_trait,
  metrics::increment_counter,
  parking_lot::Mutex,
  std::{collections::HashMap, sync::Arc},
  tokio::sync::{broadcast, oneshot},
  tokio_util::sync::CancellationToken,
  tracing::{debug, warn},
};

/// Lifecycle events a [`Session`] can emit. Subscribed to by the feature
/// service the moment a session is created, mirroring `s.opposite()`
/// being handed to `featureService->newSession`.
#[derive(Debug, Clone)]
pub enum SessionEvent {
  Connected,
  Joined,
  IdSpecified(PeerId),
  Failed(String),
  Closed,
}

#[derive(Clone)]
pub struct Session {
  inner: Arc<SessionInner>,
}

struct SessionInner {
  address: Address,
  id: Mutex<Option<PeerId>>,
  events: broadcast::Sender<SessionEvent>,
}

impl Session {
  pub fn new(address: Address, id: Option<PeerId>) -> (Self, broadcast::Receiver<SessionEvent>) {
    let (tx, rx) = broadcast::channel(16);
    let session = Session {
      inner: Arc::new(SessionInner {
        address,
        id: Mutex::new(id),
        events: tx,
      }),
    };
    (session, rx)
  }

  pub fn address(&self) -> &Address {
    &self.inner.address
  }

  pub fn id(&self) -> Option<PeerId> {
    self.inner.id.lock().clone()
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
    self.inner.events.subscribe()
  }

  fn emit(&self, event: SessionEvent) {
    let _ = self.inner.events.send(event);
  }

  pub fn set_id(&self, id: PeerId) {
    *self.inner.id.lock() = Some(id.clone());
    self.emit(SessionEvent::IdSpecified(id));
  }

  pub fn connected(&self) {
    self.emit(SessionEvent::Connected);
  }

  pub fn joined(&self) {
    self.emit(SessionEvent::Joined);
  }

  pub fn failed(&self, reason: impl Into<String>) {
    self.emit(SessionEvent::Failed(reason.into()));
  }

  pub fn closed(&self) {
    self.emit(SessionEvent::Closed);
  }
}

/// Suppresses concurrent duplicate connect attempts to the same address.
#[derive(Default)]
pub struct ConnectionsInProgress(Mutex<std::collections::HashSet<Address>>);

impl ConnectionsInProgress {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns `true` if `addr` was not already in progress (and is now
  /// marked as such); `false` if a connect to `addr` is already underway.
  pub fn begin(&self, addr: Address) -> bool {
    self.0.lock().insert(addr)
  }

  pub fn end(&self, addr: &Address) {
    self.0.lock().remove(addr);
  }
}

/// A promise awaiting the [`Remote`] produced by a successful connect to a
/// given address, or the error that ended the attempt.
pub type JoinResult = std::result::Result<Arc<dyn Remote>, String>;

/// A multimap of address to pending join-waiters: anyone who asked to
/// join an address that's already mid-connect gets woken once that
/// connect resolves, instead of starting a second connect themselves.
#[derive(Default)]
pub struct JoinWaiters {
  waiters: Mutex<HashMap<Address, Vec<oneshot::Sender<JoinResult>>>>,
}

impl JoinWaiters {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers a caller-owned sender as a waiter for `addr`. The caller
  /// (`feature.rs`'s `FeatureContext::join`) creates the channel itself so
  /// it can hand the receiver half back to its own caller as a future
  /// before the node has done anything else.
  pub fn register(&self, addr: Address, tx: oneshot::Sender<JoinResult>) {
    self.waiters.lock().entry(addr).or_default().push(tx);
  }

  pub fn flush_ok(&self, addr: &Address, remote: Arc<dyn Remote>) {
    if let Some(list) = self.waiters.lock().remove(addr) {
      for tx in list {
        let _ = tx.send(Ok(remote.clone()));
      }
    }
  }

  pub fn flush_err(&self, addr: &Address, reason: impl Into<String>) {
    let reason = reason.into();
    if let Some(list) = self.waiters.lock().remove(addr) {
      for tx in list {
        let _ = tx.send(Err(reason.clone()));
      }
    }
  }

  /// Resolves every still-pending waiter for every address with the same
  /// error, regardless of which address it was registered against. Used on
  /// node stop, where spec.md §5 requires "`joinWaiters` are all resolved
  /// with the same error" rather than just those for one address.
  pub fn flush_all_err(&self, reason: impl Into<String>) {
    let reason = reason.into();
    let all: HashMap<_, _> = self.waiters.lock().drain().collect();
    for (_, list) in all {
      for tx in list {
        let _ = tx.send(Err(reason.clone()));
      }
    }
  }
}

/// Collaborators a connect-side session worker needs. Holds reference-counted
/// handles rather than borrows so a worker can be `tokio::spawn`ed (moved
/// into a `'static` task) instead of merely awaited in place.
#[derive(Clone)]
pub struct ConnectDeps {
  pub connector: Arc<dyn Connector>,
  pub link: Arc<dyn Link>,
  pub connections_in_progress: Arc<ConnectionsInProgress>,
  pub join_waiters: Arc<JoinWaiters>,
  /// Node's stop signal. Raced against every suspension point
  /// (`connector.connect`, `link.join_by_connect`) per spec.md §5, so a
  /// worker stuck mid-connect when the node stops resolves immediately
  /// instead of hanging until the underlying I/O itself gives up.
  pub token: CancellationToken,
}

/// Connect-side session worker.
///
/// `on_new_session` is called once the session exists (before any network
/// I/O), mirroring `featureService->newSession(id, a, s.opposite())`.
/// `on_joined` is called once the remote has been authenticated, mirroring
/// `rdbInstance->addRemote(id2, r)`.
pub async fn csession_worker(
  deps: ConnectDeps,
  expected_id: Option<PeerId>,
  addr: Address,
  on_new_session: impl FnOnce(&Session),
  on_joined: impl FnOnce(PeerId, Arc<dyn Remote>),
) {
  if !deps.connections_in_progress.begin(addr.clone()) {
    debug!("connect to {addr} already in progress, suppressing duplicate");
    return;
  }

  let (session, _own_rx) = Session::new(addr.clone(), expected_id.clone());
  on_new_session(&session);

  let connect_result = cancellable(&deps.token, async {
    deps.connector.connect(&addr).await.map_err(|e| Error::Connect {
      addr: addr.to_string(),
      reason: e.to_string(),
    })
  })
  .await;
  let channel = match connect_result {
    Ok(c) => c,
    Err(e) => {
      deps.connections_in_progress.end(&addr);
      let message = if matches!(e, Error::Stop) { "node stopped".to_string() } else { e.to_string() };
      deps.join_waiters.flush_err(&addr, message.clone());
      session.failed(message);
      session.closed();
      increment_counter!("sessions_failed", "side" => "connect");
      return;
    }
  };

  // The dedup window only covers the raw connect; a second caller asking
  // to join the same address while the join handshake is still underway
  // is free to start its own connect attempt.
  deps.connections_in_progress.end(&addr);
  session.connected();

  let join_result = cancellable(&deps.token, async {
    deps.link.join_by_connect(channel).await.map_err(|e| Error::Join(e.to_string()))
  })
  .await;
  let remote = match join_result {
    Ok(r) => r,
    Err(e) => {
      let message = if matches!(e, Error::Stop) { "node stopped".to_string() } else { e.to_string() };
      deps.join_waiters.flush_err(&addr, message.clone());
      session.failed(message);
      session.closed();
      increment_counter!("sessions_failed", "side" => "connect");
      return;
    }
  };

  let actual_id = remote.id();
  let remote: Arc<dyn Remote> = Arc::from(remote);
  if expected_id.as_ref() != Some(&actual_id) {
    warn!("connect to {addr}: peer id mismatch, binding session to the id it actually presented");
    session.set_id(actual_id.clone());
  }
  session.joined();
  increment_counter!("sessions_joined", "side" => "connect");
  deps.join_waiters.flush_ok(&addr, remote.clone());
  on_joined(actual_id.clone(), remote.clone());

  let closing_session = session.clone();
  tokio::spawn(async move {
    remote.closed().await;
    closing_session.closed();
  });
}

/// Accept-side session worker: no duplicate suppression (every accepted
/// channel is a distinct connection) and no join-waiters to flush.
pub async fn asession_worker(
  link: &dyn Link,
  channel: Box<dyn Channel>,
  token: &CancellationToken,
  on_new_session: impl FnOnce(&Session),
  on_joined: impl FnOnce(PeerId, Arc<dyn Remote>),
) {
  let remote_addr = channel.remote_address();
  let (session, _own_rx) = Session::new(remote_addr, None);
  on_new_session(&session);

  let join_result = cancellable(token, async {
    link.join_by_accept(channel).await.map_err(|e| Error::Join(e.to_string()))
  })
  .await;
  let remote = match join_result {
    Ok(r) => r,
    Err(e) => {
      let message = if matches!(e, Error::Stop) { "node stopped".to_string() } else { e.to_string() };
      session.failed(message);
      increment_counter!("sessions_failed", "side" => "accept");
      return;
    }
  };

  let id = remote.id();
  let remote: Arc<dyn Remote> = Arc::from(remote);
  session.set_id(id.clone());
  session.joined();
  increment_counter!("sessions_joined", "side" => "accept");
  on_joined(id, remote.clone());

  let closing_session = session.clone();
  tokio::spawn(async move {
    remote.closed().await;
    closing_session.closed();
  });
}
