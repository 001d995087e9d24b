//! Proxy synthesis. A proxy is a locally materialised stand-in for a remote
//! object; every call on it routes through the interceptor responsible for
//! the owning process.

use crate::error::{RemoteFault, RemotingResult};
use crate::ident::ObjectId;
use crate::lock;
use crate::logging::{self, Logger};
use crate::object::{MethodInvocation, MethodReturn, RemoteObject, RemoteRef};
use hashbrown::HashMap;
use std::any::Any;
use std::sync::{Arc, Mutex};

/// The seam between proxies and the transport: turns an in-process
/// invocation into a remote request and carries the garbage-collection
/// notifications for the peer it reaches.
pub trait CallRouter: Send + Sync {
    /// Identifier of the peer this router reaches.
    fn peer_id(&self) -> &str;

    fn invoke(
        &self,
        target: &ObjectId,
        declaring_type: &str,
        invocation: MethodInvocation,
    ) -> RemotingResult<MethodReturn>;

    fn send_gc_cleanup(&self, ids: &[ObjectId]) -> RemotingResult<()>;
}

/// Everything a synthesised proxy needs: the remote identity, the declared
/// type, the announced interfaces and the router back to the owner.
#[derive(Clone)]
pub struct ProxyHandle {
    id: ObjectId,
    type_name: String,
    interfaces: Vec<String>,
    router: Arc<dyn CallRouter>,
}

impl ProxyHandle {
    #[inline]
    pub fn new(
        id: ObjectId,
        type_name: String,
        interfaces: Vec<String>,
        router: Arc<dyn CallRouter>,
    ) -> ProxyHandle {
        ProxyHandle {
            id,
            type_name,
            interfaces,
            router,
        }
    }

    #[inline]
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    #[inline]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    #[inline]
    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    #[inline]
    pub fn router(&self) -> &Arc<dyn CallRouter> {
        &self.router
    }

    /// Route a call to the remote owner.
    #[inline]
    pub fn invoke(&self, invocation: MethodInvocation) -> RemotingResult<MethodReturn> {
        self.router.invoke(&self.id, &self.type_name, invocation)
    }
}

pub type ProxyBinder = Box<dyn Fn(ProxyHandle) -> RemoteRef + Send + Sync>;

/// Builds proxies for remote identities. Typed bindings registered against a
/// type or interface name produce hand-written forwarder proxies; everything
/// else falls back to a `DynamicProxy`.
///
/// Selection is deterministic for the same inputs: the declared type wins,
/// then the first announced interface with a binding, then the dynamic
/// fallback. The declared-type rule preserves assignability at the call
/// site.
pub struct ProxyFactory {
    binders: Mutex<HashMap<String, ProxyBinder>>,
    log: Logger,
}

impl ProxyFactory {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> ProxyFactory {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        ProxyFactory {
            binders: Mutex::new(HashMap::new()),
            log,
        }
    }

    /// Register a typed proxy constructor for a type or interface name.
    pub fn bind<F>(&self, type_name: &str, binder: F)
    where
        F: Fn(ProxyHandle) -> RemoteRef + Send + Sync + 'static,
    {
        logging::debug!(self.log, "proxy binding registered"; "type" => type_name);
        lock(&self.binders).insert(type_name.to_string(), Box::new(binder));
    }

    pub fn materialize(
        &self,
        type_name: &str,
        id: ObjectId,
        interfaces: Vec<String>,
        router: Arc<dyn CallRouter>,
    ) -> RemoteRef {
        let handle = ProxyHandle::new(id, type_name.to_string(), interfaces, router);
        let binders = lock(&self.binders);

        if let Some(binder) = binders.get(type_name) {
            return binder(handle);
        }

        if let Some(binder) = handle
            .interfaces
            .iter()
            .find_map(|iface| binders.get(iface.as_str()))
        {
            return binder(handle);
        }

        logging::trace!(self.log, "no binding, synthesising dynamic proxy";
                        "type" => type_name,
                        "id" => %handle.id);

        drop(binders);
        Arc::new(DynamicProxy::new(handle))
    }
}

/// Untyped proxy used when no binding resolves the declared type. It still
/// carries the remote identity and routes `dispatch` calls, so callers that
/// work against `dyn RemoteObject` lose nothing.
pub struct DynamicProxy {
    handle: ProxyHandle,
}

impl DynamicProxy {
    #[inline]
    pub fn new(handle: ProxyHandle) -> DynamicProxy {
        DynamicProxy { handle }
    }

    #[inline]
    pub fn handle(&self) -> &ProxyHandle {
        &self.handle
    }
}

impl RemoteObject for DynamicProxy {
    fn type_name(&self) -> &str {
        self.handle.type_name()
    }

    fn interface_names(&self) -> Vec<String> {
        self.handle.interfaces.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dispatch(&self, call: MethodInvocation) -> Result<MethodReturn, RemoteFault> {
        self.handle.invoke(call).map_err(RemoteFault::from)
    }
}

/// Forwarder for a delegate target owned by a remote process. Invoking it
/// re-enters the originator over the reverse channel.
pub struct DelegateProxy {
    id: ObjectId,
    type_name: String,
    router: Arc<dyn CallRouter>,
}

impl DelegateProxy {
    #[inline]
    pub fn new(id: ObjectId, type_name: String, router: Arc<dyn CallRouter>) -> DelegateProxy {
        DelegateProxy {
            id,
            type_name,
            router,
        }
    }
}

impl RemoteObject for DelegateProxy {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dispatch(&self, call: MethodInvocation) -> Result<MethodReturn, RemoteFault> {
        let declaring = call.method.declaring_type().to_string();
        self.router
            .invoke(&self.id, &declaring, call)
            .map_err(RemoteFault::from)
    }
}
