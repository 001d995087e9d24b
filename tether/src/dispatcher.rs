//! Server-side dispatch: one worker per inbound connection reads frames in a
//! loop, resolves targets through the registry, invokes and replies. The
//! same worker runs on the client side of a reverse channel, which is how
//! callbacks dispatch symmetrically.

use crate::envelope::{self, WireContext};
use crate::error::{RemoteFault, RemotingError, RemotingResult};
use crate::gc::GcTrigger;
use crate::ident::ObjectId;
use crate::interceptor::{CallPolicy, ClientInterceptor, CALLBACK_SEQUENCE_START};
use crate::link::{Link, Terminator, LARGE_BODY_THRESHOLD};
use crate::logging::{self, Logger};
use crate::object::{MethodId, MethodInvocation, MethodReturn};
use crate::proxy::CallRouter;
use crate::registry::InstanceRegistry;
use crate::service::ServiceContainer;
use crate::value::CallArg;
use crate::wire::{self, CallHeader, FunctionType};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io;
use std::io::BufReader;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;

/// Lifecycle notifications a worker raises towards its host.
pub trait WorkerEvents: Send + Sync {
    /// A peer asked the whole endpoint to shut down.
    fn shutdown_requested(&self);
    /// The connection ended (peer closed, link fault, shutdown).
    fn connection_closed(&self, peer: &str);
}

/// Sink for workers without endpoint lifecycle, e.g. the client side of a
/// reverse channel.
pub struct NullEvents;

impl WorkerEvents for NullEvents {
    fn shutdown_requested(&self) {}
    fn connection_closed(&self, _peer: &str) {}
}

/// Shared collaborators handed to every worker of an endpoint.
#[derive(Clone)]
pub struct DispatchHost {
    pub registry: Arc<InstanceRegistry>,
    pub services: Arc<ServiceContainer>,
    pub policy: CallPolicy,
    pub log: Logger,
}

pub struct ConnectionWorker {
    host: DispatchHost,
    link: Arc<Link>,
    reader: BufReader<TcpStream>,
    peer: String,
    reverse: Option<Arc<ClientInterceptor>>,
    events: Arc<dyn WorkerEvents>,
    log: Logger,
}

impl ConnectionWorker {
    /// Wrap a freshly accepted connection with its own terminator.
    pub fn accept(
        host: DispatchHost,
        stream: TcpStream,
        events: Arc<dyn WorkerEvents>,
    ) -> io::Result<ConnectionWorker> {
        Self::from_parts(host, stream, events, Arc::new(Terminator::new()))
    }

    /// Wrap a connection that shares its terminator with an existing link
    /// pair (the reverse-channel case).
    pub fn from_parts(
        host: DispatchHost,
        stream: TcpStream,
        events: Arc<dyn WorkerEvents>,
        terminator: Arc<Terminator>,
    ) -> io::Result<ConnectionWorker> {
        let peer = stream.peer_addr()?.to_string();
        let (link, reader) = Link::new(stream, terminator, &host.log)?;
        let log = host.log.new(logging::o!("peer" => peer.clone()));

        Ok(ConnectionWorker {
            host,
            link,
            reader: BufReader::new(reader),
            peer,
            reverse: None,
            events,
            log,
        })
    }

    #[inline]
    pub fn link(&self) -> Arc<Link> {
        self.link.clone()
    }

    #[inline]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Frame loop. Per-call failures are answered with `ExceptionReturn`
    /// frames; codec and dispatch errors fault the link and end the worker.
    pub fn run(mut self) {
        logging::debug!(self.log, "worker started");

        loop {
            let header = match CallHeader::read(&mut self.reader) {
                Ok(header) => header,
                Err(err) => {
                    logging::debug!(self.log, "connection closed"; "error" => ?err);
                    break;
                }
            };

            let outcome = match header.function {
                FunctionType::OpenReverseChannel => self.open_reverse_channel(),
                FunctionType::CreateInstanceWithDefaultCtor => {
                    self.create_instance(header.sequence, false)
                }
                FunctionType::CreateInstance => self.create_instance(header.sequence, true),
                FunctionType::MethodCall => self.method_call(header.sequence),
                FunctionType::GcCleanup => self.gc_cleanup(),
                FunctionType::ShutdownServer => {
                    logging::info!(self.log, "shutdown requested by peer");
                    self.events.shutdown_requested();
                    break;
                }
                FunctionType::ServerShuttingDown => {
                    logging::debug!(self.log, "peer shutting down");
                    break;
                }
                FunctionType::MethodReply | FunctionType::ExceptionReturn => Err(
                    RemotingError::Protocol("reply frame on a dispatch link".to_string()),
                ),
            };

            if let Err(err) = outcome {
                logging::error!(self.log, "dispatch failed, dropping connection";
                                "error" => ?err);
                break;
            }
        }

        self.teardown();
    }

    fn teardown(&mut self) {
        // Tell the departing peer about every proxy held on its behalf
        // before the links go away, best effort.
        if let Some(reverse) = &self.reverse {
            let router: Arc<dyn CallRouter> = reverse.clone();
            let _ = self.host.registry.perform_gc(&router, true);
        }

        self.link.terminator().fire();
        if let Some(reverse) = &self.reverse {
            reverse.cancel_all();
            reverse.link().close();
        }
        self.link.close();

        self.events.connection_closed(&self.peer);
        logging::debug!(self.log, "worker stopped");
    }

    /// The peer announced the endpoint to dial back for callbacks. The new
    /// connection shares the terminator, so the pair lives and dies as one.
    fn open_reverse_channel(&mut self) -> RemotingResult<()> {
        let ip = wire::read_str(&mut self.reader)?;
        let port = self.reader.read_i32::<LittleEndian>()?;

        if port <= 0 || port > 65_535 {
            return Err(RemotingError::Protocol(format!(
                "reverse channel port {} out of range",
                port
            )));
        }

        logging::info!(self.log, "opening reverse channel"; "ip" => &ip, "port" => port);

        let stream = TcpStream::connect((ip.as_str(), port as u16))?;
        let (link, reader) = Link::new(stream, self.link.terminator().clone(), &self.host.log)?;

        let interceptor = Arc::new(ClientInterceptor::new(
            self.peer.clone(),
            link,
            self.host.registry.clone(),
            CALLBACK_SEQUENCE_START,
            self.host.policy.clone(),
            Arc::new(GcTrigger::new()),
            &self.host.log,
        ));

        let receiver = interceptor.clone();
        thread::Builder::new()
            .name("reverse-receiver".to_string())
            .spawn(move || receiver.run_receiver(reader))?;

        self.reverse = Some(interceptor);
        Ok(())
    }

    fn create_instance(&mut self, sequence: i32, with_args: bool) -> RemotingResult<()> {
        let type_name = wire::read_str(&mut self.reader)?;
        let _reserved = wire::read_str(&mut self.reader)?;
        let _ctor_id = self.reader.read_i32::<LittleEndian>()?;
        let _generic_args = self.reader.read_i32::<LittleEndian>()?;

        let args = match with_args {
            true => {
                let router = self.router();
                let ctx = WireContext {
                    registry: &self.host.registry,
                    peer: &self.peer,
                    router: router.as_ref(),
                };
                envelope::decode_args(&mut self.reader, &ctx)?
            }
            false => Vec::new(),
        };

        logging::debug!(self.log, "creating instance";
                        "sequence" => sequence,
                        "type" => &type_name,
                        "args" => args.len());

        let created = match with_args {
            true => self.host.services.create_with(&type_name, args),
            false => self.host.services.create(&type_name),
        };

        match created {
            Ok(obj) => self.reply(sequence, MethodReturn::single(CallArg::Object(obj))),
            Err(err) => self.reply_fault(sequence, RemoteFault::from(err)),
        }
    }

    fn method_call(&mut self, sequence: i32) -> RemotingResult<()> {
        let target = ObjectId::from_string(wire::read_str(&mut self.reader)?);
        let declaring_type = wire::read_str(&mut self.reader)?;
        let method = MethodId::from_descriptor(wire::read_str(&mut self.reader)?);
        let generic_args = wire::read_str_list(&mut self.reader)?;

        let args = {
            let router = self.router();
            let ctx = WireContext {
                registry: &self.host.registry,
                peer: &self.peer,
                router: router.as_ref(),
            };
            envelope::decode_args(&mut self.reader, &ctx)?
        };

        let obj = match self.host.registry.try_get(&target) {
            Some(obj) => obj,
            None if target.is_delegate() => {
                // Callback raced with handler removal: complete the call
                // with an empty reply, i.e. the default return value.
                logging::debug!(self.log, "delegate target gone, returning empty reply";
                                "target" => %target);
                return self.reply(sequence, MethodReturn::empty());
            }
            None => {
                logging::warn!(self.log, "unknown call target"; "target" => %target);
                return self.reply_fault(sequence, RemoteFault::not_found(&target));
            }
        };

        logging::trace!(self.log, "invoking";
                        "sequence" => sequence,
                        "target" => %target,
                        "declaring_type" => &declaring_type,
                        "method" => %method);

        // Dispatch resolves against the runtime object, which is what makes
        // interface calls land on the concrete type.
        let invocation = MethodInvocation::with_generics(method, generic_args, args);
        match obj.dispatch(invocation) {
            Ok(ret) => self.reply(sequence, ret),
            Err(fault) => self.reply_fault(sequence, fault),
        }
    }

    fn gc_cleanup(&mut self) -> RemotingResult<()> {
        let count = self.reader.read_i32::<LittleEndian>()?;

        if count < 0 {
            return Err(RemotingError::Protocol(format!(
                "negative cleanup count {}",
                count
            )));
        }

        for _ in 0..count {
            let id = ObjectId::from_string(wire::read_str(&mut self.reader)?);
            self.host.registry.remove(&id, &self.peer, true);
        }

        logging::debug!(self.log, "gc cleanup applied"; "count" => count);
        Ok(())
    }

    #[inline]
    fn router(&self) -> Option<Arc<dyn CallRouter>> {
        self.reverse
            .clone()
            .map(|interceptor| interceptor as Arc<dyn CallRouter>)
    }

    fn reply(&mut self, sequence: i32, ret: MethodReturn) -> RemotingResult<()> {
        let router = self.router();
        let ctx = WireContext {
            registry: &self.host.registry,
            peer: &self.peer,
            router: router.as_ref(),
        };

        let large = ret.values.iter().any(|value| match value {
            CallArg::Data(payload) => payload.len() >= LARGE_BODY_THRESHOLD,
            _ => false,
        });

        if large {
            self.link.transmit_with(|stream| {
                CallHeader::new(FunctionType::MethodReply, sequence).write(stream)?;
                envelope::encode_args(stream, &ret.values, &ctx)
            })
        } else {
            let mut frame = Vec::with_capacity(128);
            CallHeader::new(FunctionType::MethodReply, sequence).write(&mut frame)?;
            envelope::encode_args(&mut frame, &ret.values, &ctx)?;
            self.link.transmit(&frame)
        }
    }

    fn reply_fault(&mut self, sequence: i32, fault: RemoteFault) -> RemotingResult<()> {
        logging::debug!(self.log, "replying with fault";
                        "sequence" => sequence,
                        "exception_type" => &fault.exception_type);

        let mut frame = Vec::with_capacity(128);
        CallHeader::new(FunctionType::ExceptionReturn, sequence).write(&mut frame)?;
        wire::write_str(&mut frame, &fault.exception_type)?;
        wire::write_str(&mut frame, &fault.message)?;
        wire::write_blob(&mut frame, &fault.payload)?;

        self.link.transmit(&frame)
    }
}
