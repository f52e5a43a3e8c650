use thiserror::Error;

/// Every fallible outcome the node runtime can produce.
///
/// This crate propagates with `?` at every fallible boundary; nothing in
/// non-test code reaches for `.unwrap()`/`.expect()` on a value that can
/// come from the outside world.
#[derive(Debug, Error)]
pub enum Error {
  #[error("bad configuration: {0}")]
  Config(String),

  #[error("key material error: {0}")]
  KeyMaterial(String),

  #[error("unable to use address {addr}: {reason}")]
  TransportBind { addr: String, reason: String },

  #[error("unable to connect to {addr}: {reason}")]
  Connect { addr: String, reason: String },

  #[error("join failed: {0}")]
  Join(String),

  #[error("NAT mapping error: {0}")]
  Natt(String),

  /// Cooperative cancellation. Raised when a task owner's stop token fires
  /// while a worker is mid-flight; workers must catch this and translate it
  /// into exactly one `Session::failed`, never propagate it further.
  #[error("stopped")]
  Stop,

  #[error("feature error: {0}")]
  Feature(String),
}

impl Error {
  pub fn config(msg: impl Into<String>) -> Self {
    Self::Config(msg.into())
  }

  pub fn key_material(msg: impl Into<String>) -> Self {
    Self::KeyMaterial(msg.into())
  }

  pub fn feature(msg: impl Into<String>) -> Self {
    Self::Feature(msg.into())
  }
}

pub type Result<T> = std::result::Result<T, Error>;
