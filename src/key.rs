//! Node identity derivation.
//!
//! A node's long-lived identity key is derived deterministically from a
//! configurable list of "key material" sources (what machine it's running
//! on, its disks, its MAC addresses, ...) or from pure randomness, folded
//! into a single digest through an incremental accumulator. See
//! `config.rs`'s `ConfigTree` for the shape `parse_key` reads.

use {
  crate::{
    config::ConfigTree,
    error::{Error, Result},
  },
  blake2::{
    digest::{Update, VariableOutput},
    Blake2bVar,
  },
  rand::RngCore,
  std::{ffi::CStr, fs, path::Path},
};

/// A derived node identity. Opaque byte string of whatever size was
/// requested; callers compare/serialize it, never interpret its bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NodeKey(Vec<u8>);

impl NodeKey {
  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }
}

impl std::fmt::Debug for NodeKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "NodeKey({})", hex(&self.0))
  }
}

fn hex(bytes: &[u8]) -> String {
  bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Incremental digest accumulator. Each key material "kind" is folded in
/// as `add(kind name)`, `fetcher(...)` pushing its bytes, then `barrier()`
/// — the barrier is a domain-separation byte so that e.g. the boundary
/// between `"cpuinfo"` and its contents can never collide with a
/// differently-split pair of inputs that happen to concatenate the same.
struct Accumulator {
  hasher: Blake2bVar,
  digest_size: usize,
}

impl Accumulator {
  fn new(digest_size: usize) -> Result<Self> {
    let hasher = Blake2bVar::new(digest_size)
      .map_err(|e| Error::key_material(format!("bad digest size: {e}")))?;
    Ok(Self { hasher, digest_size })
  }

  fn add(&mut self, bytes: impl AsRef<[u8]>) {
    Update::update(&mut self.hasher, bytes.as_ref());
  }

  fn barrier(&mut self) {
    Update::update(&mut self.hasher, &[0xff_u8]);
  }

  fn digest_size(&self) -> usize {
    self.digest_size
  }

  fn finish(self, out: &mut [u8]) -> Result<()> {
    self
      .hasher
      .finalize_variable(out)
      .map_err(|e| Error::key_material(format!("digest finalize failed: {e}")))
  }
}

/// Default list of kinds folded in when the configured kind is empty or
/// `"auto"`. Order matters: it is part of what makes a derived key
/// reproducible across restarts of the same machine.
const AUTO_KINDS: &[&str] = &[
  "memInfo",
  "cpuInfo",
  "diskInfo",
  "netMacAddress",
  "osInfo",
  "appPath",
  "domainname",
  "hostname",
  "username",
];

fn fetch(kind: &str, conf: &ConfigTree, acc: &mut Accumulator) -> Result<()> {
  match kind {
    "memInfo" => fetch_mem_info(acc),
    "cpuInfo" => fetch_cpu_info(acc),
    "diskInfo" => fetch_disk_info(acc),
    "netMacAddress" => fetch_net_mac_address(acc),
    "osInfo" => fetch_os_info(acc),
    "appPath" => fetch_app_path(acc),
    "appPid" => fetch_app_pid(acc),
    "domainname" => fetch_domainname(acc),
    "hostname" => fetch_hostname(acc),
    "username" => fetch_username(acc),
    "random" => fetch_random(acc),
    "constant" => fetch_constant(conf, acc),
    other => Err(Error::key_material(format!("bad key material kind: {other}"))),
  }
}

fn try_one(kind: &str, conf: &ConfigTree, acc: &mut Accumulator) -> Result<()> {
  acc.add(kind);
  fetch(kind, conf, acc)?;
  acc.barrier();
  Ok(())
}

/// Derives a node key of `key_size` bytes from a `keyMaterial` config
/// subtree. If the subtree's own value is empty or `"auto"`, the
/// [`AUTO_KINDS`] list runs in order, followed by an implicit `constant`
/// kind seeded with `"auto"`. In every case, any named children of the
/// subtree (e.g. an explicit `<custom>memInfo</custom>` entry) are folded
/// in afterwards by name.
pub fn parse_key(config: &ConfigTree, key_size: usize) -> Result<NodeKey> {
  let mut acc = Accumulator::new(key_size)?;

  let kind = config.value_or_empty();
  if kind.is_empty() || kind == "auto" {
    for k in AUTO_KINDS {
      try_one(k, &ConfigTree::new(), &mut acc)?;
    }
    try_one("constant", &ConfigTree::leaf("auto"), &mut acc)?;
  } else {
    try_one(kind, &ConfigTree::new(), &mut acc)?;
  }

  for (child_kind, child) in config.children() {
    try_one(child_kind, child, &mut acc)?;
  }

  debug_assert_eq!(acc.digest_size(), key_size);
  let mut out = vec![0u8; key_size];
  acc.finish(&mut out)?;
  Ok(NodeKey(out))
}

fn fetch_mem_info(acc: &mut Accumulator) -> Result<()> {
  let contents = fs::read_to_string("/proc/meminfo")
    .map_err(|e| Error::key_material(format!("reading /proc/meminfo: {e}")))?;
  let line = contents
    .lines()
    .find(|l| l.starts_with("MemTotal:"))
    .ok_or_else(|| Error::key_material("no MemTotal: line in /proc/meminfo".to_string()))?;
  acc.add(line);
  Ok(())
}

fn fetch_cpu_info(acc: &mut Accumulator) -> Result<()> {
  let contents = fs::read_to_string("/proc/cpuinfo")
    .map_err(|e| Error::key_material(format!("reading /proc/cpuinfo: {e}")))?;
  // "cpu MHz" changes between reads of the same machine (frequency
  // scaling) and would make the derived key non-deterministic if folded
  // in, so it's the one line excluded.
  for line in contents.lines().filter(|l| !l.contains("cpu MHz")) {
    acc.add(line);
    acc.barrier();
  }
  Ok(())
}

fn fetch_disk_info(acc: &mut Accumulator) -> Result<()> {
  let mut names = Vec::new();
  for dir in ["/dev/disk/by-id", "/dev/disk/by-uuid"] {
    if let Ok(entries) = fs::read_dir(dir) {
      for entry in entries.flatten() {
        names.push(entry.file_name().to_string_lossy().into_owned());
      }
    }
  }
  names.sort();
  for name in names {
    acc.add(name);
    acc.barrier();
  }
  Ok(())
}

fn fetch_net_mac_address(acc: &mut Accumulator) -> Result<()> {
  let mut names = Vec::new();
  if let Ok(entries) = fs::read_dir("/sys/class/net") {
    for entry in entries.flatten() {
      if entry.path().join("device").exists() {
        names.push(entry.file_name().to_string_lossy().into_owned());
      }
    }
  }
  names.sort();
  for name in names {
    acc.add(&name);
    acc.barrier();
    if let Ok(address) = fs::read_to_string(Path::new("/sys/class/net").join(&name).join("address"))
    {
      acc.add(address.trim());
      acc.barrier();
    }
  }
  Ok(())
}

fn fetch_os_info(acc: &mut Accumulator) -> Result<()> {
  // SAFETY: `uname` writes into a stack-allocated, zeroed struct we own;
  // its fields are bounded, NUL-terminated C strings we only ever read.
  unsafe {
    let mut buf: libc::utsname = std::mem::zeroed();
    if libc::uname(&mut buf) != 0 {
      return Err(Error::key_material("uname(2) failed".to_string()));
    }
    acc.add(format!("sysname:{}", cstr_field(&buf.sysname)));
    acc.barrier();
    acc.add(format!("nodename:{}", cstr_field(&buf.nodename)));
    acc.barrier();
    acc.add(format!("release:{}", cstr_field(&buf.release)));
    acc.barrier();
    acc.add(format!("version:{}", cstr_field(&buf.version)));
    acc.barrier();
    acc.add(format!("machine:{}", cstr_field(&buf.machine)));
    acc.barrier();
  }
  if let Ok(cmdline) = fs::read_to_string("/proc/cmdline") {
    acc.add(cmdline);
    acc.barrier();
  }
  Ok(())
}

/// Reads a NUL-terminated `c_char` array field as UTF-8 (lossily).
unsafe fn cstr_field(field: &[libc::c_char]) -> String {
  CStr::from_ptr(field.as_ptr()).to_string_lossy().into_owned()
}

fn fetch_app_path(acc: &mut Accumulator) -> Result<()> {
  let path = fs::read_link("/proc/self/exe")
    .map_err(|e| Error::key_material(format!("reading /proc/self/exe: {e}")))?;
  acc.add(path.to_string_lossy().as_bytes());
  Ok(())
}

fn fetch_app_pid(acc: &mut Accumulator) -> Result<()> {
  acc.add(std::process::id().to_string());
  Ok(())
}

fn fetch_domainname(acc: &mut Accumulator) -> Result<()> {
  let mut buf = [0_u8; 256];
  // SAFETY: buf is sized well beyond any real domain name and NUL-checked
  // before use.
  let rc = unsafe {
    libc::getdomainname(buf.as_mut_ptr() as *mut libc::c_char, buf.len() as _)
  };
  if rc != 0 {
    return Err(Error::key_material("getdomainname(2) failed".to_string()));
  }
  let name = unsafe { CStr::from_ptr(buf.as_ptr() as *const libc::c_char) };
  acc.add(name.to_string_lossy().as_bytes());
  Ok(())
}

fn fetch_hostname(acc: &mut Accumulator) -> Result<()> {
  let mut buf = [0_u8; 256];
  // SAFETY: see fetch_domainname.
  let rc = unsafe {
    libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len() as _)
  };
  if rc != 0 {
    return Err(Error::key_material("gethostname(2) failed".to_string()));
  }
  let name = unsafe { CStr::from_ptr(buf.as_ptr() as *const libc::c_char) };
  acc.add(name.to_string_lossy().as_bytes());
  Ok(())
}

fn fetch_username(acc: &mut Accumulator) -> Result<()> {
  if let Ok(user) = std::env::var("USER") {
    if !user.is_empty() {
      acc.add(user);
      return Ok(());
    }
  }

  // SAFETY: getlogin returns either null or a pointer to a static,
  // NUL-terminated buffer owned by libc; we only read through it.
  unsafe {
    let login = libc::getlogin();
    if !login.is_null() {
      let name = CStr::from_ptr(login).to_string_lossy().into_owned();
      if !name.is_empty() {
        acc.add(name);
        return Ok(());
      }
    }
  }

  // SAFETY: getpwuid returns either null or a pointer to a static struct
  // owned by libc; pw_name is a NUL-terminated C string within it.
  unsafe {
    let uid = libc::geteuid();
    let pw = libc::getpwuid(uid);
    if !pw.is_null() {
      let name = CStr::from_ptr((*pw).pw_name).to_string_lossy().into_owned();
      if !name.is_empty() {
        acc.add(name);
        return Ok(());
      }
    }
  }

  Err(Error::key_material(
    "unable to determine username from $USER, getlogin() or getpwuid()".to_string(),
  ))
}

fn fetch_random(acc: &mut Accumulator) -> Result<()> {
  let mut bytes = [0_u8; 256];
  rand::thread_rng().fill_bytes(&mut bytes);
  acc.add(bytes);
  Ok(())
}

fn fetch_constant(conf: &ConfigTree, acc: &mut Accumulator) -> Result<()> {
  acc.add(conf.value_or_empty());
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn constant_kind_is_deterministic_and_size_matches() {
    let conf = ConfigTree::leaf("constant");
    let key1 = parse_key(&conf, 64).unwrap();
    let key2 = parse_key(&conf, 64).unwrap();
    assert_eq!(key1.as_bytes().len(), 64);
    assert_eq!(key1, key2);
  }

  #[test]
  fn different_constant_value_differs() {
    let mut t1 = ConfigTree::new();
    t1.push_child("constant", ConfigTree::leaf("a"));
    let mut t2 = ConfigTree::new();
    t2.push_child("constant", ConfigTree::leaf("b"));
    assert_ne!(
      parse_key(&t1, 32).unwrap(),
      parse_key(&t2, 32).unwrap()
    );
  }

  #[test]
  fn barrier_between_fields_prevents_concatenation_collision() {
    let mut acc1 = Accumulator::new(32).unwrap();
    acc1.add("ab");
    acc1.barrier();
    acc1.add("c");
    let mut out1 = vec![0u8; 32];
    acc1.finish(&mut out1).unwrap();

    let mut acc2 = Accumulator::new(32).unwrap();
    acc2.add("a");
    acc2.barrier();
    acc2.add("bc");
    let mut out2 = vec![0u8; 32];
    acc2.finish(&mut out2).unwrap();

    assert_ne!(out1, out2, "barrier must domain-separate adjacent fields");
  }

  #[test]
  fn random_kind_differs_between_calls() {
    let conf = ConfigTree::leaf("random");
    let a = parse_key(&conf, 32).unwrap();
    let b = parse_key(&conf, 32).unwrap();
    assert_ne!(a, b);
  }

  #[test]
  fn unknown_kind_is_rejected() {
    let conf = ConfigTree::leaf("not-a-real-kind");
    assert!(parse_key(&conf, 32).is_err());
  }
}
