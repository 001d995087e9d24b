//! End-to-end exercises over real sockets: create-and-call, reference
//! round-trips, out parameters, exception propagation, reverse-channel
//! callbacks, the distributed GC handshake and server shutdown.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tether::error::RemoteFault;
use tether::{
    CallArg, ClientConfig, DelegateRef, MethodId, MethodInvocation, MethodReturn, ObjectId,
    ProxyHandle, RemoteObject, RemoteRef, RemotingClient, RemotingContext, RemotingError,
    RemotingResult, RemotingServer, ServerConfig,
};

const MARSHALLABLE: &str = "demo.MarshallableClass";
const SHARED: &str = "demo.SharedMarshallable";
const COMPONENT: &str = "demo.ReferencedComponent";
const HANDLER: &str = "demo.RecordingHandler";

// ---------------------------------------------------------------------------
// Server-side remotable classes.
// ---------------------------------------------------------------------------

struct ReferencedComponent {
    name: Mutex<String>,
}

impl ReferencedComponent {
    fn new() -> ReferencedComponent {
        ReferencedComponent {
            name: Mutex::new("component".to_string()),
        }
    }
}

impl RemoteObject for ReferencedComponent {
    fn type_name(&self) -> &str {
        COMPONENT
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dispatch(&self, call: MethodInvocation) -> Result<MethodReturn, RemoteFault> {
        match call.method.simple_name() {
            "name" => {
                let name = self.name.lock().unwrap().clone();
                Ok(MethodReturn::single(
                    CallArg::serialize(&name).map_err(RemoteFault::from)?,
                ))
            }
            "set_name" => {
                let name: String = call.args[0].get().map_err(RemoteFault::from)?;
                *self.name.lock().unwrap() = name;
                Ok(MethodReturn::empty())
            }
            other => Err(RemoteFault::unsupported(format!(
                "{} has no method {}",
                COMPONENT, other
            ))),
        }
    }
}

struct MarshallableClass {
    component: Arc<ReferencedComponent>,
    handlers: Mutex<Vec<DelegateRef>>,
}

impl MarshallableClass {
    fn new() -> MarshallableClass {
        MarshallableClass {
            component: Arc::new(ReferencedComponent::new()),
            handlers: Mutex::new(Vec::new()),
        }
    }

    fn raise_event(&self, value: i32) -> Result<i32, RemoteFault> {
        let handlers: Vec<DelegateRef> = self.handlers.lock().unwrap().clone();
        let mut total = 0;

        for handler in handlers {
            let reply = handler
                .invoke(vec![CallArg::serialize(&value).map_err(RemoteFault::from)?])
                .map_err(RemoteFault::from)?;

            // A gone delegate target yields an empty reply, i.e. the default
            // return value.
            if reply.value().is_some() {
                total += reply.get::<i32>().map_err(RemoteFault::from)?;
            }
        }

        Ok(total)
    }
}

impl RemoteObject for MarshallableClass {
    fn type_name(&self) -> &str {
        MARSHALLABLE
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dispatch(&self, call: MethodInvocation) -> Result<MethodReturn, RemoteFault> {
        match call.method.simple_name() {
            "add_values" => {
                let a: i32 = call.args[0].get().map_err(RemoteFault::from)?;
                let b: i32 = call.args[1].get().map_err(RemoteFault::from)?;
                Ok(MethodReturn::single(
                    CallArg::serialize(&(a + b)).map_err(RemoteFault::from)?,
                ))
            }
            "get_component" => {
                let component: RemoteRef = self.component.clone();
                Ok(MethodReturn::single(CallArg::Object(component)))
            }
            "uses_own_component" => {
                let incoming = call.args[0]
                    .object()
                    .ok_or_else(|| RemoteFault::unsupported("expected an object argument"))?;
                let own: RemoteRef = self.component.clone();
                Ok(MethodReturn::single(
                    CallArg::serialize(&Arc::ptr_eq(&own, &incoming)).map_err(RemoteFault::from)?,
                ))
            }
            "try_parse_int" => {
                let text: String = call.args[0].get().map_err(RemoteFault::from)?;
                let (ok, value) = match text.parse::<i32>() {
                    Ok(value) => (true, value),
                    Err(_) => (false, 0),
                };
                Ok(MethodReturn::with_outputs(
                    CallArg::serialize(&ok).map_err(RemoteFault::from)?,
                    vec![CallArg::serialize(&value).map_err(RemoteFault::from)?],
                ))
            }
            "fail" => Err(RemoteFault::new("InvalidOperationException", "nope")),
            "add_handler" => {
                let delegate = call.args[0]
                    .delegate()
                    .ok_or_else(|| RemoteFault::unsupported("expected a delegate argument"))?;
                self.handlers.lock().unwrap().push(delegate.clone());
                Ok(MethodReturn::empty())
            }
            "remove_handler" => {
                let delegate = call.args[0]
                    .delegate()
                    .ok_or_else(|| RemoteFault::unsupported("expected a delegate argument"))?;
                self.handlers
                    .lock()
                    .unwrap()
                    .retain(|existing| !existing.matches(delegate));
                Ok(MethodReturn::empty())
            }
            "raise_event" => {
                let value: i32 = call.args[0].get().map_err(RemoteFault::from)?;
                let total = self.raise_event(value)?;
                Ok(MethodReturn::single(
                    CallArg::serialize(&total).map_err(RemoteFault::from)?,
                ))
            }
            other => Err(RemoteFault::unsupported(format!(
                "{} has no method {}",
                MARSHALLABLE, other
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Client-side typed proxy (hand-written forwarder).
// ---------------------------------------------------------------------------

struct MarshallableProxy {
    handle: ProxyHandle,
}

impl MarshallableProxy {
    fn method(name: &str, params: &[(&str, &str)]) -> MethodId {
        MethodId::new(MARSHALLABLE, name, &[], params)
    }

    fn add_values(&self, a: i32, b: i32) -> RemotingResult<i32> {
        let method = Self::method("add_values", &[("i32", "a"), ("i32", "b")]);
        self.handle
            .invoke(MethodInvocation::new(
                method,
                vec![CallArg::serialize(&a)?, CallArg::serialize(&b)?],
            ))?
            .get()
    }

    fn get_component(&self) -> RemotingResult<RemoteRef> {
        let method = Self::method("get_component", &[]);
        let reply = self.handle.invoke(MethodInvocation::new(method, Vec::new()))?;
        reply
            .value()
            .and_then(|value| value.object())
            .ok_or_else(|| RemotingError::Protocol("expected an object reply".to_string()))
    }

    fn uses_own_component(&self, component: &RemoteRef) -> RemotingResult<bool> {
        let method = Self::method("uses_own_component", &[(COMPONENT, "component")]);
        self.handle
            .invoke(MethodInvocation::new(
                method,
                vec![CallArg::Object(component.clone())],
            ))?
            .get()
    }

    fn try_parse_int(&self, text: &str) -> RemotingResult<(bool, i32)> {
        let method = Self::method("try_parse_int", &[("String", "text"), ("i32", "value")]);
        let reply = self
            .handle
            .invoke(MethodInvocation::new(method, vec![CallArg::serialize(text)?]))?;

        let ok: bool = reply.get()?;
        let value: i32 = reply
            .output(0)
            .ok_or_else(|| RemotingError::Protocol("missing out value".to_string()))?
            .get()?;
        Ok((ok, value))
    }

    fn fail(&self) -> RemotingResult<MethodReturn> {
        let method = Self::method("fail", &[]);
        self.handle.invoke(MethodInvocation::new(method, Vec::new()))
    }

    fn add_handler(&self, delegate: &DelegateRef) -> RemotingResult<()> {
        let method = Self::method("add_handler", &[(HANDLER, "handler")]);
        self.handle.invoke(MethodInvocation::new(
            method,
            vec![CallArg::Delegate(delegate.clone())],
        ))?;
        Ok(())
    }

    fn remove_handler(&self, delegate: &DelegateRef) -> RemotingResult<()> {
        let method = Self::method("remove_handler", &[(HANDLER, "handler")]);
        self.handle.invoke(MethodInvocation::new(
            method,
            vec![CallArg::Delegate(delegate.clone())],
        ))?;
        Ok(())
    }

    fn raise_event(&self, value: i32) -> RemotingResult<i32> {
        let method = Self::method("raise_event", &[("i32", "value")]);
        self.handle
            .invoke(MethodInvocation::new(method, vec![CallArg::serialize(&value)?]))?
            .get()
    }
}

impl RemoteObject for MarshallableProxy {
    fn type_name(&self) -> &str {
        self.handle.type_name()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dispatch(&self, call: MethodInvocation) -> Result<MethodReturn, RemoteFault> {
        self.handle.invoke(call).map_err(RemoteFault::from)
    }
}

// ---------------------------------------------------------------------------
// Client-side callback handler.
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<i32>>,
}

impl RecordingHandler {
    fn event_method() -> MethodId {
        MethodId::new(HANDLER, "on_event", &[], &[("i32", "value")])
    }
}

impl RemoteObject for RecordingHandler {
    fn type_name(&self) -> &str {
        HANDLER
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dispatch(&self, call: MethodInvocation) -> Result<MethodReturn, RemoteFault> {
        match call.method.simple_name() {
            "on_event" => {
                let value: i32 = call.args[0].get().map_err(RemoteFault::from)?;
                self.seen.lock().unwrap().push(value);
                Ok(MethodReturn::single(
                    CallArg::serialize(&(value * 2)).map_err(RemoteFault::from)?,
                ))
            }
            other => Err(RemoteFault::unsupported(format!(
                "{} has no method {}",
                HANDLER, other
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Fixtures.
// ---------------------------------------------------------------------------

struct ServerFixture {
    server: Arc<RemotingServer>,
    context: Arc<RemotingContext>,
    addr: SocketAddr,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServerFixture {
    fn start() -> ServerFixture {
        let context = Arc::new(RemotingContext::new(None));
        context
            .services()
            .register_default(MARSHALLABLE, || Arc::new(MarshallableClass::new()));

        let shared = Arc::new(MarshallableClass::new());
        context.services().register_default(SHARED, move || {
            let singleton: RemoteRef = shared.clone();
            singleton
        });

        let config = ServerConfig {
            address: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        };
        let server = Arc::new(RemotingServer::bind(&context, config, None).unwrap());
        let addr = server.local_addr();

        let thread = {
            let server = server.clone();
            thread::spawn(move || {
                let _ = server.run();
            })
        };

        ServerFixture {
            server,
            context,
            addr,
            thread: Some(thread),
        }
    }
}

impl Drop for ServerFixture {
    fn drop(&mut self) {
        self.server.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn connect(addr: SocketAddr) -> (Arc<RemotingContext>, RemotingClient) {
    let context = Arc::new(RemotingContext::new(None));
    context
        .proxy_factory()
        .bind(MARSHALLABLE, |handle| Arc::new(MarshallableProxy { handle }));
    context
        .proxy_factory()
        .bind(SHARED, |handle| Arc::new(MarshallableProxy { handle }));

    let client = RemotingClient::connect(&context, addr, ClientConfig::default(), None).unwrap();
    (context, client)
}

fn as_proxy(obj: &RemoteRef) -> &MarshallableProxy {
    obj.as_any()
        .downcast_ref::<MarshallableProxy>()
        .expect("typed proxy expected")
}

fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {}", what);
}

// ---------------------------------------------------------------------------
// Scenarios.
// ---------------------------------------------------------------------------

#[test]
fn test_default_ctor_create_and_call() {
    let fixture = ServerFixture::start();
    let (_context, client) = connect(fixture.addr);

    let obj = client.create_remote_instance(MARSHALLABLE).unwrap();
    assert_eq!(obj.type_name(), MARSHALLABLE);

    let sum = as_proxy(&obj).add_values(3, 4).unwrap();
    assert_eq!(sum, 7);
}

#[test]
fn test_reference_roundtrip_preserves_identity() {
    let fixture = ServerFixture::start();
    let (_context, client) = connect(fixture.addr);

    let obj = client.create_remote_instance(MARSHALLABLE).unwrap();
    let proxy = as_proxy(&obj);

    let component = proxy.get_component().unwrap();
    assert_eq!(component.type_name(), COMPONENT);

    // Passing the proxy back must hand the server its original instance.
    assert!(proxy.uses_own_component(&component).unwrap());

    // A different instance's component must not match.
    let other = client.create_remote_instance(MARSHALLABLE).unwrap();
    let foreign = as_proxy(&other).get_component().unwrap();
    assert!(!proxy.uses_own_component(&foreign).unwrap());
}

#[test]
fn test_out_parameters() {
    let fixture = ServerFixture::start();
    let (_context, client) = connect(fixture.addr);

    let obj = client.create_remote_instance(MARSHALLABLE).unwrap();
    let proxy = as_proxy(&obj);

    assert_eq!(proxy.try_parse_int("42").unwrap(), (true, 42));
    assert_eq!(proxy.try_parse_int("forty-two").unwrap(), (false, 0));
}

#[test]
fn test_exception_propagation() {
    let fixture = ServerFixture::start();
    let (_context, client) = connect(fixture.addr);

    let obj = client.create_remote_instance(MARSHALLABLE).unwrap();
    let result = as_proxy(&obj).fail();

    match result {
        Err(RemotingError::Remote(fault)) => {
            assert_eq!(fault.exception_type, "InvalidOperationException");
            assert_eq!(fault.message, "nope");
        }
        other => panic!("Unexpected result {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_callback_via_reverse_channel() {
    let fixture = ServerFixture::start();
    let (_context, client) = connect(fixture.addr);

    let obj = client.create_remote_instance(MARSHALLABLE).unwrap();
    let proxy = as_proxy(&obj);

    let handler = Arc::new(RecordingHandler::default());
    let target: RemoteRef = handler.clone();

    proxy
        .add_handler(&DelegateRef::new(RecordingHandler::event_method(), target.clone()))
        .unwrap();

    // The server raises the event; the client's delegate runs and its return
    // value is observed on the server.
    assert_eq!(proxy.raise_event(21).unwrap(), 42);
    assert_eq!(handler.seen.lock().unwrap().as_slice(), &[21]);

    // Unsubscribing with an equivalent delegate removes the handler.
    proxy
        .remove_handler(&DelegateRef::new(RecordingHandler::event_method(), target))
        .unwrap();

    assert_eq!(proxy.raise_event(5).unwrap(), 0);
    assert_eq!(handler.seen.lock().unwrap().as_slice(), &[21]);
}

#[test]
fn test_gc_handshake_across_two_peers() {
    let fixture = ServerFixture::start();
    let (_context_one, client_one) = connect(fixture.addr);
    let (_context_two, client_two) = connect(fixture.addr);

    let registry = fixture.context.registry().clone();

    let obj_one = client_one.create_remote_instance(SHARED).unwrap();
    let obj_two = client_two.create_remote_instance(SHARED).unwrap();

    let id: ObjectId = as_proxy(&obj_one).handle.id().clone();
    assert_eq!(as_proxy(&obj_two).handle.id(), &id);

    // Both peers hold references.
    assert_eq!(registry.reference_bits(&id).map(u64::count_ones), Some(2));

    // First peer drops its proxy; the sweep must reach the server and clear
    // exactly that peer's bit.
    drop(obj_one);
    client_one.force_gc();
    {
        let registry = registry.clone();
        let id = id.clone();
        wait_until("first peer's reference bit to clear", move || {
            registry.reference_bits(&id).map(u64::count_ones) == Some(1)
        });
    }

    // The object stays alive for the second peer.
    assert_eq!(as_proxy(&obj_two).add_values(20, 3).unwrap(), 23);

    // Once the second peer lets go as well, the entry disappears and the
    // object becomes collectable on the server.
    drop(obj_two);
    client_two.force_gc();
    {
        let registry = registry.clone();
        let id = id.clone();
        wait_until("entry to be removed", move || !registry.contains(&id));
    }
}

#[test]
fn test_server_shutdown_fails_remaining_calls() {
    let fixture = ServerFixture::start();
    let (_context, client) = connect(fixture.addr);

    let obj = client.create_remote_instance(MARSHALLABLE).unwrap();
    assert_eq!(as_proxy(&obj).add_values(1, 1).unwrap(), 2);

    client.shutdown_server().unwrap();

    wait_until("server to stop", || !fixture.server.is_running());

    let result = as_proxy(&obj).add_values(1, 1);
    assert_eq!(result.unwrap_err(), RemotingError::LinkDown);
}
