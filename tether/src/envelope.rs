//! Argument envelopes: how one value crosses the wire. Inline values carry
//! the codec payload behind a `SerializedItem` tag; marshal-by-reference
//! objects are registered and written as `NewProxy` (first sight for the
//! destination peer) or `RemoteReference` (already known, or travelling back
//! to its owner); delegates become `MethodPointer` entries with their
//! deterministic target identifier.

use crate::error::{RemotingError, RemotingResult};
use crate::ident::ObjectId;
use crate::object::MethodId;
use crate::proxy::{CallRouter, DelegateProxy};
use crate::registry::InstanceRegistry;
use crate::value::{CallArg, DelegateRef};
use crate::wire::{self, ReferenceTag};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::sync::Arc;

/// Upper bound on the argument count of a single call.
const MAX_ARGS: i32 = 1024;

/// Everything the envelope needs to translate between values and references:
/// the process registry, the destination/source peer, and, on the decoding
/// side, a router able to reach that peer for proxy synthesis.
pub struct WireContext<'a> {
    pub registry: &'a Arc<InstanceRegistry>,
    pub peer: &'a str,
    pub router: Option<&'a Arc<dyn CallRouter>>,
}

pub fn encode_arg<W: Write + ?Sized>(
    stream: &mut W,
    arg: &CallArg,
    ctx: &WireContext,
) -> RemotingResult<()> {
    match arg {
        CallArg::Null => ReferenceTag::NullPointer.write(stream),
        CallArg::Data(payload) => {
            ReferenceTag::SerializedItem.write(stream)?;
            wire::write_blob(stream, payload)
        }
        CallArg::TypeName(name) => {
            ReferenceTag::InstanceOfSystemType.write(stream)?;
            wire::write_str(stream, name)
        }
        CallArg::TypeNameArray(names) => {
            ReferenceTag::ArrayOfSystemType.write(stream)?;
            wire::write_str_list(stream, names)
        }
        CallArg::Object(obj) => {
            let registered = ctx.registry.register(obj, Some(ctx.peer))?;

            if registered.first_for_peer && !registered.back_to_origin {
                ReferenceTag::NewProxy.write(stream)?;
                wire::write_str(stream, &registered.type_name)?;
                wire::write_str(stream, registered.id.as_str())?;
                wire::write_str_list(stream, &registered.interfaces)
            } else {
                ReferenceTag::RemoteReference.write(stream)?;
                wire::write_str(stream, registered.id.as_str())
            }
        }
        CallArg::Delegate(delegate) => {
            let id = ctx.registry.register_delegate(delegate, Some(ctx.peer))?;
            ReferenceTag::MethodPointer.write(stream)?;
            wire::write_str(stream, id.as_str())?;
            wire::write_str(stream, delegate.method().as_str())
        }
    }
}

pub fn decode_arg<R: Read>(stream: &mut R, ctx: &WireContext) -> RemotingResult<CallArg> {
    match ReferenceTag::read(stream)? {
        ReferenceTag::NullPointer => Ok(CallArg::Null),
        ReferenceTag::SerializedItem => Ok(CallArg::Data(wire::read_blob(stream)?)),
        ReferenceTag::InstanceOfSystemType => Ok(CallArg::TypeName(wire::read_str(stream)?)),
        ReferenceTag::ArrayOfSystemType => {
            Ok(CallArg::TypeNameArray(wire::read_str_list(stream)?))
        }
        ReferenceTag::NewProxy => {
            let type_name = wire::read_str(stream)?;
            let id = ObjectId::from_string(wire::read_str(stream)?);
            let interfaces = wire::read_str_list(stream)?;
            resolve_reference(ctx, &id, &type_name, &interfaces)
        }
        ReferenceTag::RemoteReference => {
            let id = ObjectId::from_string(wire::read_str(stream)?);
            resolve_reference(ctx, &id, "", &[])
        }
        ReferenceTag::MethodPointer => {
            let id = ObjectId::from_string(wire::read_str(stream)?);
            let method = MethodId::from_descriptor(wire::read_str(stream)?);
            decode_delegate(ctx, id, method)
        }
    }
}

/// Materialise or look up the object behind a reference. Identifiers owned
/// by this process resolve to the original instance, never a proxy.
fn resolve_reference(
    ctx: &WireContext,
    id: &ObjectId,
    type_name: &str,
    interfaces: &[String],
) -> RemotingResult<CallArg> {
    if ctx.registry.is_local(id) {
        return ctx
            .registry
            .try_get(id)
            .map(CallArg::Object)
            .ok_or_else(|| RemotingError::InstanceNotFound(id.clone()));
    }

    let router = ctx.router.ok_or_else(|| {
        RemotingError::Unsupported(format!("no channel to materialise reference {}", id))
    })?;

    ctx.registry
        .create_or_get_proxy(type_name, id, interfaces, router)
        .map(CallArg::Object)
}

fn decode_delegate(ctx: &WireContext, id: ObjectId, method: MethodId) -> RemotingResult<CallArg> {
    if ctx.registry.is_local(&id) {
        let target = ctx
            .registry
            .try_get(&id)
            .ok_or_else(|| RemotingError::InstanceNotFound(id.clone()))?;
        return Ok(CallArg::Delegate(DelegateRef::with_id(id, method, target)));
    }

    let target = match ctx.registry.try_get(&id) {
        Some(existing) => existing,
        None => {
            let router = ctx.router.ok_or_else(|| {
                RemotingError::Unsupported(format!("no reverse channel for delegate {}", id))
            })?;
            let proxy: crate::object::RemoteRef = Arc::new(DelegateProxy::new(
                id.clone(),
                method.declaring_type().to_string(),
                router.clone(),
            ));
            ctx.registry.adopt_proxy(&id, &proxy, router.peer_id())?
        }
    };

    Ok(CallArg::Delegate(DelegateRef::with_id(id, method, target)))
}

/// Write a counted argument list.
pub fn encode_args<W: Write + ?Sized>(
    stream: &mut W,
    args: &[CallArg],
    ctx: &WireContext,
) -> RemotingResult<()> {
    stream.write_i32::<LittleEndian>(args.len() as i32)?;
    for arg in args {
        encode_arg(stream, arg, ctx)?;
    }
    Ok(())
}

pub fn decode_args<R: Read>(stream: &mut R, ctx: &WireContext) -> RemotingResult<Vec<CallArg>> {
    let count = stream.read_i32::<LittleEndian>()?;

    if count < 0 || count > MAX_ARGS {
        return Err(RemotingError::Protocol(format!(
            "argument count {} out of bounds",
            count
        )));
    }

    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        args.push(decode_arg(stream, ctx)?);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteFault;
    use crate::lock;
    use crate::object::{MethodInvocation, MethodReturn, RemoteObject, RemoteRef};
    use crate::proxy::ProxyFactory;
    use crate::wire::ReferenceTag;
    use std::any::Any;
    use std::io::Cursor;
    use std::sync::Mutex;

    struct Widget;

    impl RemoteObject for Widget {
        fn type_name(&self) -> &str {
            "test.Widget"
        }

        fn interface_names(&self) -> Vec<String> {
            vec!["test.IWidget".to_string()]
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn dispatch(&self, _call: MethodInvocation) -> Result<MethodReturn, RemoteFault> {
            Ok(MethodReturn::empty())
        }
    }

    struct StubRouter {
        peer: String,
        invoked: Mutex<Vec<ObjectId>>,
    }

    impl StubRouter {
        fn new(peer: &str) -> Arc<StubRouter> {
            Arc::new(StubRouter {
                peer: peer.to_string(),
                invoked: Mutex::new(Vec::new()),
            })
        }
    }

    impl CallRouter for StubRouter {
        fn peer_id(&self) -> &str {
            &self.peer
        }

        fn invoke(
            &self,
            target: &ObjectId,
            _declaring_type: &str,
            _invocation: MethodInvocation,
        ) -> RemotingResult<MethodReturn> {
            lock(&self.invoked).push(target.clone());
            Ok(MethodReturn::empty())
        }

        fn send_gc_cleanup(&self, _ids: &[ObjectId]) -> RemotingResult<()> {
            Ok(())
        }
    }

    struct Peer {
        registry: Arc<InstanceRegistry>,
        stub: Arc<StubRouter>,
        router: Arc<dyn CallRouter>,
        name: String,
    }

    impl Peer {
        fn new(name: &str, reaches: &str) -> Peer {
            let stub = StubRouter::new(reaches);
            Peer {
                registry: Arc::new(InstanceRegistry::new(Arc::new(ProxyFactory::new(None)), None)),
                router: stub.clone(),
                stub,
                name: name.to_string(),
            }
        }

        fn ctx(&self) -> WireContext {
            WireContext {
                registry: &self.registry,
                peer: &self.name,
                router: Some(&self.router),
            }
        }
    }

    fn transfer(from: &Peer, to: &Peer, arg: &CallArg) -> CallArg {
        let mut buffer = Vec::new();
        encode_arg(
            &mut buffer,
            arg,
            &WireContext {
                registry: &from.registry,
                peer: &to.name,
                router: None,
            },
        )
        .unwrap();

        let mut cursor = Cursor::new(buffer);
        decode_arg(&mut cursor, &to.ctx()).unwrap()
    }

    fn written_tag(buffer: &[u8]) -> ReferenceTag {
        let mut cursor = Cursor::new(buffer);
        ReferenceTag::read(&mut cursor).unwrap()
    }

    #[test]
    fn test_inline_values_roundtrip() {
        let alice = Peer::new("alice", "bob");
        let bob = Peer::new("bob", "alice");

        let decoded = transfer(&alice, &bob, &CallArg::serialize(&7i32).unwrap());
        assert_eq!(decoded.get::<i32>().unwrap(), 7);

        assert!(transfer(&alice, &bob, &CallArg::Null).is_null());

        match transfer(&alice, &bob, &CallArg::TypeName("demo.T".to_string())) {
            CallArg::TypeName(name) => assert_eq!(name, "demo.T"),
            other => panic!("Unexpected value {:?}", other),
        }

        let names = vec!["demo.A".to_string(), "demo.B".to_string()];
        match transfer(&alice, &bob, &CallArg::TypeNameArray(names.clone())) {
            CallArg::TypeNameArray(decoded) => assert_eq!(decoded, names),
            other => panic!("Unexpected value {:?}", other),
        }
    }

    #[test]
    fn test_object_becomes_proxy_then_remote_reference() {
        let alice = Peer::new("alice", "bob");
        let bob = Peer::new("bob", "alice");

        let widget: RemoteRef = Arc::new(Widget);
        let arg = CallArg::Object(widget.clone());

        // First send announces a new proxy.
        let mut buffer = Vec::new();
        encode_arg(
            &mut buffer,
            &arg,
            &WireContext {
                registry: &alice.registry,
                peer: "bob",
                router: None,
            },
        )
        .unwrap();
        assert_eq!(written_tag(&buffer), ReferenceTag::NewProxy);

        let decoded = decode_arg(&mut Cursor::new(buffer), &bob.ctx()).unwrap();
        let proxy = decoded.object().unwrap();
        assert_eq!(proxy.type_name(), "test.Widget");

        // Subsequent sends are bare references.
        let mut buffer = Vec::new();
        encode_arg(
            &mut buffer,
            &arg,
            &WireContext {
                registry: &alice.registry,
                peer: "bob",
                router: None,
            },
        )
        .unwrap();
        assert_eq!(written_tag(&buffer), ReferenceTag::RemoteReference);
    }

    #[test]
    fn test_reference_returns_to_original_object() {
        let alice = Peer::new("alice", "bob");
        let bob = Peer::new("bob", "alice");

        let widget: RemoteRef = Arc::new(Widget);

        // alice → bob: bob holds a proxy.
        let proxy = transfer(&alice, &bob, &CallArg::Object(widget.clone()))
            .object()
            .unwrap();
        assert!(!Arc::ptr_eq(&proxy, &widget));

        // bob → alice: the reference travels back to its owner and resolves
        // to the original instance, not another proxy.
        let mut buffer = Vec::new();
        encode_arg(
            &mut buffer,
            &CallArg::Object(proxy),
            &WireContext {
                registry: &bob.registry,
                peer: "alice",
                router: None,
            },
        )
        .unwrap();
        assert_eq!(written_tag(&buffer), ReferenceTag::RemoteReference);

        let returned = decode_arg(&mut Cursor::new(buffer), &alice.ctx())
            .unwrap()
            .object()
            .unwrap();
        assert!(Arc::ptr_eq(&returned, &widget));
    }

    #[test]
    fn test_delegate_roundtrip_reaches_target_id() {
        let alice = Peer::new("alice", "bob");
        let bob = Peer::new("bob", "alice");

        let handler: RemoteRef = Arc::new(Widget);
        let method = MethodId::new("test.Widget", "on_change", &[], &[("i32", "value")]);
        let delegate = DelegateRef::new(method.clone(), handler.clone());

        let decoded = transfer(&alice, &bob, &CallArg::Delegate(delegate.clone()));
        let decoded = decoded.delegate().unwrap();

        let target_id = decoded.target_id().unwrap().clone();
        assert!(target_id.is_delegate());
        assert_eq!(target_id.prefix(), alice.registry.own_prefix());
        assert_eq!(decoded.method(), &method);

        // Invoking the decoded delegate routes through bob's router at the
        // deterministic target identifier.
        decoded.invoke(Vec::new()).unwrap();
        assert_eq!(lock(&bob.stub.invoked).as_slice(), &[target_id.clone()]);

        // Re-sending the same delegate matches the first transfer.
        let again = transfer(&alice, &bob, &CallArg::Delegate(delegate));
        assert!(again.delegate().unwrap().matches(decoded));
    }

    #[test]
    fn test_decode_without_router_fails() {
        let alice = Peer::new("alice", "bob");
        let bob = Peer::new("bob", "alice");

        let widget: RemoteRef = Arc::new(Widget);
        let mut buffer = Vec::new();
        encode_arg(
            &mut buffer,
            &CallArg::Object(widget),
            &WireContext {
                registry: &alice.registry,
                peer: "bob",
                router: None,
            },
        )
        .unwrap();

        let result = decode_arg(
            &mut Cursor::new(buffer),
            &WireContext {
                registry: &bob.registry,
                peer: "alice",
                router: None,
            },
        );

        match result {
            Err(RemotingError::Unsupported(_)) => (),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_args_list_roundtrip() {
        let alice = Peer::new("alice", "bob");
        let bob = Peer::new("bob", "alice");

        let args = vec![
            CallArg::serialize(&1i32).unwrap(),
            CallArg::Null,
            CallArg::serialize("two").unwrap(),
        ];

        let mut buffer = Vec::new();
        encode_args(
            &mut buffer,
            &args,
            &WireContext {
                registry: &alice.registry,
                peer: "bob",
                router: None,
            },
        )
        .unwrap();

        let decoded = decode_args(&mut Cursor::new(buffer), &bob.ctx()).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].get::<i32>().unwrap(), 1);
        assert!(decoded[1].is_null());
        assert_eq!(decoded[2].get::<String>().unwrap(), "two");
    }

    #[test]
    fn test_negative_arg_count_is_rejected() {
        let bob = Peer::new("bob", "alice");

        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(-1i32).to_le_bytes());

        match decode_args(&mut Cursor::new(buffer), &bob.ctx()) {
            Err(RemotingError::Protocol(_)) => (),
            other => panic!("Unexpected result {:?}", other),
        }
    }
}
