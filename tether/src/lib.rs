#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

//! Transparent bidirectional remoting between two processes. A client
//! obtains a handle to an object hosted in a server process and invokes its
//! methods as if it were local; arguments and results flow over a framed
//! binary stream, references materialise as proxies on the receiving side,
//! and a reverse channel makes callbacks and delegates work symmetrically.
//! A per-process registry keeps object identity stable across hops, and a
//! distributed garbage-collection handshake releases remote references once
//! their local callers are gone.

pub mod client;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod gc;
pub mod ident;
pub mod interceptor;
pub mod link;
pub mod logging;
pub mod object;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod service;
pub mod value;
pub mod wire;

pub use crate::client::{ClientConfig, RemotingClient};
pub use crate::error::{RemoteFault, RemotingError, RemotingResult};
pub use crate::ident::ObjectId;
pub use crate::interceptor::CallPolicy;
pub use crate::object::{MethodId, MethodInvocation, MethodReturn, RemoteObject, RemoteRef};
pub use crate::proxy::{CallRouter, ProxyFactory, ProxyHandle};
pub use crate::registry::InstanceRegistry;
pub use crate::server::{RemotingServer, ServerConfig};
pub use crate::service::ServiceContainer;
pub use crate::value::{CallArg, DelegateRef};

use crate::logging::Logger;
use std::sync::{Arc, Mutex, MutexGuard};

/// Default server port.
pub const DEFAULT_PORT: u16 = 4600;

/// Lock acquisition with poison recovery. The guarded state is defined for
/// every lock-holder exit path, so a panicked holder does not wedge the
/// process-wide tables.
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The process-wide remoting state: one registry, one service container and
/// one proxy factory shared by every client and server endpoint the process
/// hosts. Sharing a single context is what lets an object round-trip
/// correctly through a process that is client to one peer and server to
/// another.
pub struct RemotingContext {
    registry: Arc<InstanceRegistry>,
    services: Arc<ServiceContainer>,
    factory: Arc<ProxyFactory>,
    log: Logger,
}

impl RemotingContext {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> RemotingContext {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        let factory = Arc::new(ProxyFactory::new(&log));
        let registry = Arc::new(InstanceRegistry::new(factory.clone(), &log));
        let services = Arc::new(ServiceContainer::new(&log));

        RemotingContext {
            registry,
            services,
            factory,
            log,
        }
    }

    #[inline]
    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    #[inline]
    pub fn services(&self) -> &Arc<ServiceContainer> {
        &self.services
    }

    #[inline]
    pub fn proxy_factory(&self) -> &Arc<ProxyFactory> {
        &self.factory
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        &self.log
    }
}
