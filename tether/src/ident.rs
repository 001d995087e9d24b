//! Stable identifiers for remoted instances.
//!
//! An identifier reads `"<machine>:<pid-hex>.<seq>/<counter-hex>"`. The part
//! before the slash is the process identifier; a registry treats an id as
//! local iff that prefix matches its own. Peers never interpret identifiers.

use lazy_static::lazy_static;
use std::env;
use std::fmt;
use std::process;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

lazy_static! {
    static ref MACHINE_NAME: String = machine_name();
}

static REGISTRY_SEQUENCE: AtomicU32 = AtomicU32::new(1);

fn machine_name() -> String {
    env::var("HOSTNAME")
        .or_else(|_| env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Mints identifiers on behalf of a single registry instance. The embedded
/// sequence number makes prefixes unique even when one process hosts several
/// registries (the test escape hatch for simulating multiple processes).
pub struct IdentifierSource {
    prefix: String,
    sequence: u32,
    counter: AtomicU64,
}

impl IdentifierSource {
    pub fn new() -> IdentifierSource {
        let sequence = REGISTRY_SEQUENCE.fetch_add(1, Ordering::Relaxed);

        IdentifierSource {
            prefix: format!("{}:{:x}.{}", *MACHINE_NAME, process::id(), sequence),
            sequence,
            counter: AtomicU64::new(0),
        }
    }

    /// The process identifier owned by this source.
    #[inline]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The per-process registry sequence embedded in the prefix.
    #[inline]
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Mint a fresh identifier.
    #[inline]
    pub fn next(&self) -> ObjectId {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        ObjectId(format!("{}/{:x}", self.prefix, count))
    }

    /// Mint a delegate-target identifier from a deterministic token. The same
    /// token always yields the same identifier.
    #[inline]
    pub fn delegate(&self, token: u64) -> ObjectId {
        ObjectId(format!("{}/cb{:016x}", self.prefix, token))
    }
}

/// Identifier of a single remoted instance.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ObjectId(String);

impl ObjectId {
    #[inline]
    pub fn from_string(raw: String) -> ObjectId {
        ObjectId(raw)
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The process identifier portion (everything before the slash).
    #[inline]
    pub fn prefix(&self) -> &str {
        match self.0.find('/') {
            Some(pos) => &self.0[..pos],
            None => &self.0,
        }
    }

    /// The per-process portion (everything after the slash).
    #[inline]
    pub fn local_part(&self) -> &str {
        match self.0.find('/') {
            Some(pos) => &self.0[pos + 1..],
            None => "",
        }
    }

    /// True for identifiers minted by `IdentifierSource::delegate`. Counter
    /// identifiers are at most 16 hex digits, so the 18-character `cb` form
    /// cannot collide with them.
    #[inline]
    pub fn is_delegate(&self) -> bool {
        let local = self.local_part();
        local.len() == 18 && local.starts_with("cb")
    }
}

impl fmt::Display for ObjectId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}
