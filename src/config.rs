//! Hierarchical configuration tree.
//!
//! Mirrors the shape the node is actually configured with: an ordered,
//! possibly-repeated-key multimap of children, each carrying an optional
//! scalar value of its own. This is what lets `transport_hub.rs` iterate
//! every `custom` address entry under a hub's config block, and what lets
//! `key.rs` walk arbitrary named key-material children without a fixed
//! schema.

use crate::error::{Error, Result};

/// One node of a configuration tree: an optional scalar value plus an
/// ordered list of named children. Keys may repeat (e.g. multiple `custom`
/// entries); insertion order is preserved and is significant for
/// `equal_range`-style iteration.
#[derive(Debug, Clone, Default)]
pub struct ConfigTree {
  value: Option<String>,
  children: Vec<(String, ConfigTree)>,
}

impl ConfigTree {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn leaf(value: impl Into<String>) -> Self {
    Self {
      value: Some(value.into()),
      children: Vec::new(),
    }
  }

  pub fn set_value(&mut self, value: impl Into<String>) -> &mut Self {
    self.value = Some(value.into());
    self
  }

  /// Appends a child under `key`, preserving any existing children with the
  /// same key (repeated keys are how `custom` address lists are modeled).
  pub fn push_child(
    &mut self,
    key: impl Into<String>,
    child: ConfigTree,
  ) -> &mut Self {
    self.children.push((key.into(), child));
    self
  }

  pub fn value(&self) -> Option<&str> {
    self.value.as_deref()
  }

  /// The scalar value of this node, or the empty string if none was set.
  /// Mirrors the default-to-empty behavior the key material parser relies
  /// on when reading a bare top-level value.
  pub fn value_or_empty(&self) -> &str {
    self.value.as_deref().unwrap_or("")
  }

  /// First child matching `key`, if any.
  pub fn get_child(&self, key: &str) -> Option<&ConfigTree> {
    self
      .children
      .iter()
      .find(|(k, _)| k == key)
      .map(|(_, v)| v)
  }

  /// All children matching `key`, in insertion order.
  pub fn equal_range<'a>(
    &'a self,
    key: &'a str,
  ) -> impl Iterator<Item = &'a ConfigTree> + 'a {
    self
      .children
      .iter()
      .filter(move |(k, _)| k == key)
      .map(|(_, v)| v)
  }

  /// All children, regardless of key, in insertion order.
  pub fn children(&self) -> impl Iterator<Item = (&str, &ConfigTree)> {
    self.children.iter().map(|(k, v)| (k.as_str(), v))
  }

  /// Scalar value of the first child matching `key`, or `default` if absent.
  pub fn get(&self, key: &str, default: &str) -> String {
    self
      .get_child(key)
      .and_then(|c| c.value())
      .unwrap_or(default)
      .to_string()
  }
}

/// Parses the `{t|true|on|enable|allow|1}` / `{f|false|off|disable|deny|0}`
/// boolean grammar, case-insensitively.
pub fn parse_bool(param: &str) -> Result<bool> {
  match param.to_ascii_lowercase().as_str() {
    "t" | "true" | "on" | "enable" | "allow" | "1" => Ok(true),
    "f" | "false" | "off" | "disable" | "deny" | "0" => Ok(false),
    _ => Err(Error::config(format!(
      "bad node boolean value provided: {param}"
    ))),
  }
}

pub fn parse_uint16(param: &str) -> Result<u16> {
  param
    .parse::<u16>()
    .map_err(|_| Error::config(format!("bad uint16 value provided: {param}")))
}
