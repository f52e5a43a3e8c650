//! NAT mapping lifecycle for a single declared local address.
//!
//! Each locally bound address can have at most one active external-address
//! mapping attempt. This module tracks that per-address state machine
//! (unestablished → established → unestablished, or torn down entirely
//! when the mapping capability itself goes away) and turns its
//! transitions into the declare/undeclare actions `node.rs` must apply.
//! The concrete NAT traversal strategy (`NattCapability`) is deliberately
//! out of scope to implement here — only consumed.

use {
  crate::transport::Address,
  async_trait::async_trait,
  std::collections::HashMap,
  tokio::sync::broadcast,
  tracing::debug,
};

/// Events a single mapping attempt can report over its lifetime.
#[derive(Debug, Clone)]
pub enum NattMappingEvent {
  Established(Address),
  Unestablished,
  InvolvedChanged(bool),
}

/// A single mapping attempt in progress for one internal address.
#[async_trait]
pub trait NattMappingApi: Send + Sync {
  fn events(&self) -> broadcast::Receiver<NattMappingEvent>;
  async fn stop(&self);
}

/// The NAT traversal capability: given an internal address, attempts to
/// establish (and keep alive) a port mapping to some externally reachable
/// address.
#[async_trait]
pub trait NattCapability: Send + Sync {
  async fn create_mapping(&self, internal: Address) -> crate::error::Result<Box<dyn NattMappingApi>>;
}

/// Declare/undeclare actions the owning node must apply in response to a
/// mapping state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NattAction {
  Declare(Address),
  Undeclare(Address),
}

struct Mapping {
  api: Box<dyn NattMappingApi>,
  external: Option<Address>,
}

/// Owns every active mapping, keyed by the internal (locally bound)
/// address it was created for.
pub struct NattManager {
  capability: Box<dyn NattCapability>,
  mappings: HashMap<Address, Mapping>,
}

impl NattManager {
  pub fn new(capability: Box<dyn NattCapability>) -> Self {
    Self {
      capability,
      mappings: HashMap::new(),
    }
  }

  /// Starts a mapping attempt for `internal`. Returns the event stream the
  /// caller must pump into [`Self::handle_event`].
  pub async fn create(
    &mut self,
    internal: Address,
  ) -> crate::error::Result<broadcast::Receiver<NattMappingEvent>> {
    let api = self.capability.create_mapping(internal.clone()).await?;
    let events = api.events();
    self.mappings.insert(internal, Mapping { api, external: None });
    Ok(events)
  }

  pub fn is_active(&self, internal: &Address) -> bool {
    self.mappings.contains_key(internal)
  }

  /// Applies one event read from a mapping's event stream, returning the
  /// declare/undeclare actions the node must perform as a result. An
  /// `involvedChanged(false)` mirrors the original mapping's destructor
  /// ordering: undeclare any established external address, then drop the
  /// mapping entirely.
  pub fn handle_event(
    &mut self,
    internal: &Address,
    event: NattMappingEvent,
  ) -> Vec<NattAction> {
    let Some(mapping) = self.mappings.get_mut(internal) else {
      return Vec::new();
    };

    let mut actions = Vec::new();
    match event {
      NattMappingEvent::Established(external) => {
        debug!("natt: mapping established for {internal}: {external}");
        if let Some(old) = mapping.external.take() {
          actions.push(NattAction::Undeclare(old));
        }
        actions.push(NattAction::Declare(external.clone()));
        mapping.external = Some(external);
      }
      NattMappingEvent::Unestablished => {
        debug!("natt: mapping unestablished for {internal}");
        if let Some(old) = mapping.external.take() {
          actions.push(NattAction::Undeclare(old));
        }
      }
      NattMappingEvent::InvolvedChanged(false) => {
        debug!("natt: mapping no longer involved for {internal}, dropping");
        if let Some(old) = mapping.external.take() {
          actions.push(NattAction::Undeclare(old));
        }
        self.mappings.remove(internal);
      }
      NattMappingEvent::InvolvedChanged(true) => {}
    }
    actions
  }

  /// Stops and removes a single mapping, undeclaring its external address
  /// if one was established.
  pub async fn remove(&mut self, internal: &Address) -> Vec<NattAction> {
    let Some(mapping) = self.mappings.remove(internal) else {
      return Vec::new();
    };
    mapping.api.stop().await;
    match mapping.external {
      Some(addr) => vec![NattAction::Undeclare(addr)],
      None => Vec::new(),
    }
  }

  /// Stops and removes every mapping, in no particular order (mirrors
  /// stopping and clearing the whole mapping table on node shutdown).
  pub async fn clear(&mut self) -> Vec<NattAction> {
    let internals: Vec<Address> = self.mappings.keys().cloned().collect();
    let mut actions = Vec::new();
    for internal in internals {
      actions.extend(self.remove(&internal).await);
    }
    actions
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct FakeMapping {
    tx: broadcast::Sender<NattMappingEvent>,
  }

  #[async_trait]
  impl NattMappingApi for FakeMapping {
    fn events(&self) -> broadcast::Receiver<NattMappingEvent> {
      self.tx.subscribe()
    }
    async fn stop(&self) {}
  }

  struct FakeCapability;

  #[async_trait]
  impl NattCapability for FakeCapability {
    async fn create_mapping(
      &self,
      _internal: Address,
    ) -> crate::error::Result<Box<dyn NattMappingApi>> {
      let (tx, _rx) = broadcast::channel(8);
      Ok(Box::new(FakeMapping { tx }))
    }
  }

  #[tokio::test]
  async fn established_then_reestablished_undeclares_old_external() {
    let mut manager = NattManager::new(Box::new(FakeCapability));
    let internal = Address::new("tcp4://0.0.0.0:9000");
    manager.create(internal.clone()).await.unwrap();

    let actions = manager.handle_event(
      &internal,
      NattMappingEvent::Established(Address::new("tcp4://1.2.3.4:9000")),
    );
    assert_eq!(actions, vec![NattAction::Declare(Address::new("tcp4://1.2.3.4:9000"))]);

    let actions = manager.handle_event(
      &internal,
      NattMappingEvent::Established(Address::new("tcp4://5.6.7.8:9000")),
    );
    assert_eq!(
      actions,
      vec![
        NattAction::Undeclare(Address::new("tcp4://1.2.3.4:9000")),
        NattAction::Declare(Address::new("tcp4://5.6.7.8:9000")),
      ]
    );
  }

  #[tokio::test]
  async fn involved_changed_false_drops_the_mapping() {
    let mut manager = NattManager::new(Box::new(FakeCapability));
    let internal = Address::new("tcp4://0.0.0.0:9000");
    manager.create(internal.clone()).await.unwrap();
    manager.handle_event(
      &internal,
      NattMappingEvent::Established(Address::new("tcp4://1.2.3.4:9000")),
    );

    let actions = manager.handle_event(&internal, NattMappingEvent::InvolvedChanged(false));
    assert_eq!(actions, vec![NattAction::Undeclare(Address::new("tcp4://1.2.3.4:9000"))]);
    assert!(!manager.is_active(&internal));
  }

  #[tokio::test]
  async fn clear_undeclares_every_established_mapping() {
    let mut manager = NattManager::new(Box::new(FakeCapability));
    let a = Address::new("tcp4://0.0.0.0:9000");
    let b = Address::new("tcp6://[::]:9000");
    manager.create(a.clone()).await.unwrap();
    manager.create(b.clone()).await.unwrap();
    manager.handle_event(&a, NattMappingEvent::Established(Address::new("tcp4://1.1.1.1:9000")));
    manager.handle_event(&b, NattMappingEvent::Established(Address::new("tcp6://[::2]:9000")));

    let actions = manager.clear().await;
    assert_eq!(actions.len(), 2);
    assert!(actions.contains(&NattAction::Undeclare(Address::new("tcp4://1.1.1.1:9000"))));
    assert!(actions.contains(&NattAction::Undeclare(Address::new("tcp6://[::2]:9000"))));
  }
}
