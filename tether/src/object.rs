//! The dispatch seam every remotable object implements, plus the stable
//! method descriptors that identify operations on the wire.

use crate::error::{RemoteFault, RemotingResult};
use crate::value::CallArg;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Stable textual descriptor of a method: declaring type, name, generic
/// arguments and parameter types + names. The descriptor survives renames of
/// local symbols that do not touch the declared signature, and distinguishes
/// overloads by parameter types.
///
/// Format: `Declaring.Type::name<G1, G2>(ty1 p1, ty2 p2)`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct MethodId {
    descriptor: String,
}

impl MethodId {
    pub fn new(
        declaring_type: &str,
        name: &str,
        generic_args: &[&str],
        params: &[(&str, &str)],
    ) -> MethodId {
        let mut descriptor = String::with_capacity(64);

        descriptor.push_str(declaring_type);
        descriptor.push_str("::");
        descriptor.push_str(name);

        if !generic_args.is_empty() {
            descriptor.push('<');
            for (i, arg) in generic_args.iter().enumerate() {
                if i > 0 {
                    descriptor.push_str(", ");
                }
                descriptor.push_str(arg);
            }
            descriptor.push('>');
        }

        descriptor.push('(');
        for (i, (param_type, param_name)) in params.iter().enumerate() {
            if i > 0 {
                descriptor.push_str(", ");
            }
            descriptor.push_str(param_type);
            descriptor.push(' ');
            descriptor.push_str(param_name);
        }
        descriptor.push(')');

        MethodId { descriptor }
    }

    /// Wrap a descriptor received off the wire.
    #[inline]
    pub fn from_descriptor(descriptor: String) -> MethodId {
        MethodId { descriptor }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.descriptor
    }

    /// The bare method name, without declaring type, generics or parameters.
    pub fn simple_name(&self) -> &str {
        let head = match self.descriptor.find('(') {
            Some(pos) => &self.descriptor[..pos],
            None => &self.descriptor[..],
        };
        let head = match head.find('<') {
            Some(pos) => &head[..pos],
            None => head,
        };
        match head.rfind("::") {
            Some(pos) => &head[pos + 2..],
            None => head,
        }
    }

    /// The declaring type portion of the descriptor.
    pub fn declaring_type(&self) -> &str {
        let head = match self.descriptor.find('(') {
            Some(pos) => &self.descriptor[..pos],
            None => &self.descriptor[..],
        };
        match head.rfind("::") {
            Some(pos) => &head[..pos],
            None => "",
        }
    }
}

impl fmt::Display for MethodId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.descriptor)
    }
}

/// A single decoded call: the method, resolved generic argument type names
/// and the argument values.
#[derive(Debug)]
pub struct MethodInvocation {
    pub method: MethodId,
    pub generic_args: Vec<String>,
    pub args: Vec<CallArg>,
}

impl MethodInvocation {
    #[inline]
    pub fn new(method: MethodId, args: Vec<CallArg>) -> MethodInvocation {
        MethodInvocation {
            method,
            generic_args: Vec::new(),
            args,
        }
    }

    #[inline]
    pub fn with_generics(
        method: MethodId,
        generic_args: Vec<String>,
        args: Vec<CallArg>,
    ) -> MethodInvocation {
        MethodInvocation {
            method,
            generic_args,
            args,
        }
    }
}

/// The values travelling back in a `MethodReply`: the return value first,
/// then any out parameters. An empty list is a void return.
#[derive(Debug, Default)]
pub struct MethodReturn {
    pub values: Vec<CallArg>,
}

impl MethodReturn {
    #[inline]
    pub fn empty() -> MethodReturn {
        MethodReturn { values: Vec::new() }
    }

    #[inline]
    pub fn single(value: CallArg) -> MethodReturn {
        MethodReturn {
            values: vec![value],
        }
    }

    #[inline]
    pub fn with_outputs(value: CallArg, outputs: Vec<CallArg>) -> MethodReturn {
        let mut values = Vec::with_capacity(1 + outputs.len());
        values.push(value);
        values.extend(outputs);
        MethodReturn { values }
    }

    /// The return value slot, when present.
    #[inline]
    pub fn value(&self) -> Option<&CallArg> {
        self.values.first()
    }

    /// Out parameter by position (the return value is not counted).
    #[inline]
    pub fn output(&self, index: usize) -> Option<&CallArg> {
        self.values.get(index + 1)
    }

    /// Decode the return value through the inline codec.
    #[inline]
    pub fn get<T: serde::de::DeserializeOwned>(&self) -> RemotingResult<T> {
        match self.value() {
            Some(value) => value.get(),
            None => Err(crate::error::RemotingError::Serialization(
                "reply carries no return value".to_string(),
            )),
        }
    }
}

/// An object whose identity is preserved across process boundaries. Instances
/// travel as references; the receiving side materialises a proxy whose calls
/// route back to the original.
///
/// `dispatch` is the reflection seam: implementations resolve the descriptor
/// (normally by its simple name) and execute the call, returning the values
/// for the reply or the fault to ship back. Proxies implement the same trait
/// by forwarding the invocation to the remote owner.
pub trait RemoteObject: Send + Sync {
    fn type_name(&self) -> &str;

    /// Interface names announced alongside `NewProxy` references, so the
    /// receiver can fall back to an interface proxy for unresolvable types.
    fn interface_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn as_any(&self) -> &dyn Any;

    fn dispatch(&self, call: MethodInvocation) -> Result<MethodReturn, RemoteFault>;
}

/// Shared-ownership handle to a remotable object.
pub type RemoteRef = Arc<dyn RemoteObject>;

impl std::fmt::Debug for dyn RemoteObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteObject")
            .field("type_name", &self.type_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_format() {
        let method = MethodId::new(
            "demo.Calculator",
            "add_values",
            &[],
            &[("i32", "a"), ("i32", "b")],
        );

        assert_eq!(method.as_str(), "demo.Calculator::add_values(i32 a, i32 b)");
        assert_eq!(method.simple_name(), "add_values");
        assert_eq!(method.declaring_type(), "demo.Calculator");
    }

    #[test]
    fn test_descriptor_with_generics() {
        let method = MethodId::new(
            "demo.Repository",
            "fetch",
            &["Item"],
            &[("String", "key")],
        );

        assert_eq!(method.as_str(), "demo.Repository::fetch<Item>(String key)");
        assert_eq!(method.simple_name(), "fetch");
        assert_eq!(method.declaring_type(), "demo.Repository");
    }

    #[test]
    fn test_overloads_are_distinct() {
        let by_int = MethodId::new("demo.T", "set", &[], &[("i32", "value")]);
        let by_str = MethodId::new("demo.T", "set", &[], &[("String", "value")]);

        assert_ne!(by_int, by_str);
        assert_eq!(by_int.simple_name(), by_str.simple_name());
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let method = MethodId::new("demo.T", "ping", &[], &[]);
        let decoded = MethodId::from_descriptor(method.as_str().to_string());

        assert_eq!(decoded, method);
        assert_eq!(decoded.simple_name(), "ping");
    }
}
