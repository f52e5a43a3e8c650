mod config;
mod error;
mod feature;
mod key;
mod natt;
mod net_enumerator;
mod node;
mod session;
mod task;
mod transport;
mod transport_hub;

pub use {
  config::ConfigTree,
  error::{Error, Result},
  feature::{Agent, Feature, FeatureContext, FeatureService, NodeCommand, NodeEvent},
  key::{parse_key, NodeKey},
  natt::{NattAction, NattCapability, NattManager, NattMappingApi, NattMappingEvent},
  net_enumerator::{LinkAddress, LinkEvent, LinkId, NetEnumerator, NetHost, NetLink},
  node::{Node, NodeDeps, RdbSink, DEFAULT_KEY_SIZE},
  session::{
    asession_worker, csession_worker, ConnectDeps, ConnectionsInProgress, JoinResult, JoinWaiters,
    Session, SessionEvent,
  },
  task::{cancellable, TaskOwner},
  transport::{
    Acceptor, AcceptorsHi, AcceptorStarted, Address, Channel, Connector, ConnectorsHi, Family,
    Involved, Link, Locality, NetAddress, PeerId, Remote, Scope,
  },
  transport_hub::{Hi, TransportHub},
};
