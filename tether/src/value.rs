//! Argument values as they cross the remoting boundary.

use crate::error::{RemotingError, RemotingResult};
use crate::ident::ObjectId;
use crate::object::{MethodId, MethodInvocation, MethodReturn, RemoteRef};
use std::fmt;
use std::sync::Arc;

/// One argument or return value. Inline values carry an opaque codec payload
/// (bincode); marshal-by-reference objects and delegates travel as
/// references and materialise as proxies on the receiving side.
#[derive(Clone)]
pub enum CallArg {
    Null,
    /// Inline value, already passed through the codec.
    Data(Vec<u8>),
    /// Marshal-by-reference object.
    Object(RemoteRef),
    /// Callback target plus the method it points at.
    Delegate(DelegateRef),
    /// A type, encoded by name.
    TypeName(String),
    /// An array of types, encoded by name.
    TypeNameArray(Vec<String>),
}

impl CallArg {
    /// Run a value through the inline codec.
    #[inline]
    pub fn serialize<T: serde::Serialize + ?Sized>(value: &T) -> RemotingResult<CallArg> {
        let payload = bincode::serialize(value)
            .map_err(|err| RemotingError::Serialization(err.to_string()))?;
        Ok(CallArg::Data(payload))
    }

    /// Decode an inline value.
    pub fn get<T: serde::de::DeserializeOwned>(&self) -> RemotingResult<T> {
        match self {
            CallArg::Data(payload) => bincode::deserialize(payload)
                .map_err(|err| RemotingError::Serialization(err.to_string())),
            CallArg::Null => Err(RemotingError::Serialization(
                "cannot decode a null value".to_string(),
            )),
            _ => Err(RemotingError::Serialization(
                "value is a reference, not serialised data".to_string(),
            )),
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        match self {
            CallArg::Null => true,
            _ => false,
        }
    }

    #[inline]
    pub fn object(&self) -> Option<RemoteRef> {
        match self {
            CallArg::Object(obj) => Some(obj.clone()),
            _ => None,
        }
    }

    #[inline]
    pub fn delegate(&self) -> Option<&DelegateRef> {
        match self {
            CallArg::Delegate(delegate) => Some(delegate),
            _ => None,
        }
    }
}

impl fmt::Debug for CallArg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CallArg::Null => write!(f, "Null"),
            CallArg::Data(payload) => write!(f, "Data({} bytes)", payload.len()),
            CallArg::Object(obj) => write!(f, "Object({})", obj.type_name()),
            CallArg::Delegate(delegate) => write!(f, "Delegate({})", delegate.method()),
            CallArg::TypeName(name) => write!(f, "TypeName({})", name),
            CallArg::TypeNameArray(names) => write!(f, "TypeNameArray({:?})", names),
        }
    }
}

/// The pair (method, receiver) a callback refers to. On the producing side
/// the target is the local handler object; once decoded from the wire the
/// target is a forwarder that re-enters the originator over its reverse
/// channel. The target identifier is deterministic for a given method and
/// receiver, so remote add/remove of handlers match up.
#[derive(Clone)]
pub struct DelegateRef {
    method: MethodId,
    target: RemoteRef,
    target_id: Option<ObjectId>,
}

impl DelegateRef {
    /// Point a delegate at a local handler object. The identifier is
    /// assigned when the delegate is first encoded.
    #[inline]
    pub fn new(method: MethodId, target: RemoteRef) -> DelegateRef {
        DelegateRef {
            method,
            target,
            target_id: None,
        }
    }

    #[inline]
    pub(crate) fn with_id(id: ObjectId, method: MethodId, target: RemoteRef) -> DelegateRef {
        DelegateRef {
            method,
            target,
            target_id: Some(id),
        }
    }

    #[inline]
    pub fn method(&self) -> &MethodId {
        &self.method
    }

    #[inline]
    pub fn target(&self) -> &RemoteRef {
        &self.target
    }

    #[inline]
    pub fn target_id(&self) -> Option<&ObjectId> {
        self.target_id.as_ref()
    }

    /// Invoke the callback with the supplied arguments.
    pub fn invoke(&self, args: Vec<CallArg>) -> RemotingResult<MethodReturn> {
        self.target
            .dispatch(MethodInvocation::new(self.method.clone(), args))
            .map_err(|fault| fault.into_error())
    }

    /// Two delegates match when they name the same target and method. Known
    /// identifiers are compared when both sides carry one; otherwise the
    /// receivers are compared by identity.
    pub fn matches(&self, other: &DelegateRef) -> bool {
        if self.method != other.method {
            return false;
        }

        match (&self.target_id, &other.target_id) {
            (Some(own), Some(theirs)) => own == theirs,
            _ => Arc::ptr_eq(&self.target, &other.target),
        }
    }
}

impl fmt::Debug for DelegateRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "DelegateRef({}, target {:?})",
            self.method,
            self.target_id.as_ref().map(|id| id.as_str())
        )
    }
}
