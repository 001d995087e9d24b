//! Process-wide service container: constructor bindings consulted by the
//! dispatcher for `CreateInstance` requests, plus a type-indexed singleton
//! side. Entries are never removed during normal operation; treat the
//! container as append-only.

use crate::error::{RemotingError, RemotingResult};
use crate::lock;
use crate::logging::{self, Logger};
use crate::object::RemoteRef;
use crate::value::CallArg;
use hashbrown::HashMap;
use std::sync::Mutex;

type SingletonMap = anymap::Map<dyn anymap::any::Any + Send + Sync>;

pub type DefaultConstructor = Box<dyn Fn() -> RemoteRef + Send + Sync>;
pub type ArgConstructor = Box<dyn Fn(Vec<CallArg>) -> RemotingResult<RemoteRef> + Send + Sync>;

struct Constructors {
    default: Option<DefaultConstructor>,
    with_args: Option<ArgConstructor>,
}

impl Constructors {
    fn empty() -> Constructors {
        Constructors {
            default: None,
            with_args: None,
        }
    }
}

pub struct ServiceContainer {
    constructors: Mutex<HashMap<String, Constructors>>,
    singletons: Mutex<SingletonMap>,
    log: Logger,
}

impl ServiceContainer {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> ServiceContainer {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        ServiceContainer {
            constructors: Mutex::new(HashMap::new()),
            singletons: Mutex::new(SingletonMap::new()),
            log,
        }
    }

    /// Bind the default constructor for a remotable type name.
    pub fn register_default<F>(&self, type_name: &str, ctor: F)
    where
        F: Fn() -> RemoteRef + Send + Sync + 'static,
    {
        logging::debug!(self.log, "default constructor registered"; "type" => type_name);

        lock(&self.constructors)
            .entry(type_name.to_string())
            .or_insert_with(Constructors::empty)
            .default = Some(Box::new(ctor));
    }

    /// Bind the argument-taking constructor for a remotable type name.
    pub fn register_ctor<F>(&self, type_name: &str, ctor: F)
    where
        F: Fn(Vec<CallArg>) -> RemotingResult<RemoteRef> + Send + Sync + 'static,
    {
        logging::debug!(self.log, "constructor registered"; "type" => type_name);

        lock(&self.constructors)
            .entry(type_name.to_string())
            .or_insert_with(Constructors::empty)
            .with_args = Some(Box::new(ctor));
    }

    pub fn create(&self, type_name: &str) -> RemotingResult<RemoteRef> {
        let constructors = lock(&self.constructors);

        match constructors.get(type_name).and_then(|c| c.default.as_ref()) {
            Some(ctor) => Ok(ctor()),
            None => Err(RemotingError::Unsupported(format!(
                "no default constructor registered for {}",
                type_name
            ))),
        }
    }

    pub fn create_with(&self, type_name: &str, args: Vec<CallArg>) -> RemotingResult<RemoteRef> {
        let constructors = lock(&self.constructors);

        if let Some(bindings) = constructors.get(type_name) {
            if let Some(ctor) = &bindings.with_args {
                return ctor(args);
            }
            if args.is_empty() {
                if let Some(ctor) = &bindings.default {
                    return Ok(ctor());
                }
            }
        }

        Err(RemotingError::Unsupported(format!(
            "no matching constructor registered for {}",
            type_name
        )))
    }

    pub fn put_singleton<T: Send + Sync + 'static>(&self, value: T) {
        lock(&self.singletons).insert(value);
    }

    pub fn get_singleton<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        lock(&self.singletons).get::<T>().cloned()
    }
}
