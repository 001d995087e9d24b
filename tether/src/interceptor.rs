//! Client-side interception: turns a local method invocation into a
//! request/reply exchange on the link. One receiver thread per outbound
//! link pumps replies back into the pending-call table.

use crate::envelope::{self, WireContext};
use crate::error::{RemoteFault, RemotingError, RemotingResult};
use crate::gc::GcTrigger;
use crate::ident::ObjectId;
use crate::link::{Link, LARGE_BODY_THRESHOLD};
use crate::lock;
use crate::logging::{self, Logger};
use crate::object::{MethodInvocation, MethodReturn};
use crate::proxy::CallRouter;
use crate::registry::InstanceRegistry;
use crate::value::CallArg;
use crate::wire::{self, CallHeader, FunctionType};
use byteorder::{LittleEndian, WriteBytesExt};
use hashbrown::HashMap;
use std::io::{BufReader, Write};
use std::mem;
use std::net::TcpStream;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Client-originated sequences start here.
pub const CLIENT_SEQUENCE_START: i32 = 1;
/// Server-originated (callback) sequences start here so the two senders on a
/// stream never collide.
pub const CALLBACK_SEQUENCE_START: i32 = 10_000;

/// Remote method that tears the server down; losing the link while waiting
/// for its reply is the expected outcome, not an error.
pub const TERMINATE_SERVICE_METHOD: &str = "terminate_remote_server_service";

/// Per-interceptor behaviour switches.
#[derive(Clone)]
pub struct CallPolicy {
    /// When false, `to_string` on a proxy returns a local placeholder
    /// instead of a round trip.
    pub remote_to_string: bool,
}

impl Default for CallPolicy {
    fn default() -> CallPolicy {
        CallPolicy {
            remote_to_string: false,
        }
    }
}

enum CallState {
    Assigned,
    Sent,
    Awaiting,
    Replied(MethodReturn),
    Faulted(RemotingError),
    Cancelled,
}

/// State machine for one outstanding call. The caller blocks on the
/// condition until the receiver thread delivers an outcome or the link
/// terminator cancels everything.
pub struct CallContext {
    sequence: i32,
    state: Mutex<CallState>,
    cond: Condvar,
}

impl CallContext {
    fn new(sequence: i32) -> CallContext {
        CallContext {
            sequence,
            state: Mutex::new(CallState::Assigned),
            cond: Condvar::new(),
        }
    }

    #[inline]
    pub fn sequence(&self) -> i32 {
        self.sequence
    }

    fn mark_sent(&self) {
        let mut state = lock(&self.state);
        if let CallState::Assigned = *state {
            *state = CallState::Sent;
        }
    }

    fn complete(&self, ret: MethodReturn) {
        *lock(&self.state) = CallState::Replied(ret);
        self.cond.notify_all();
    }

    fn fault(&self, err: RemotingError) {
        *lock(&self.state) = CallState::Faulted(err);
        self.cond.notify_all();
    }

    fn cancel(&self) {
        *lock(&self.state) = CallState::Cancelled;
        self.cond.notify_all();
    }

    fn wait(&self) -> RemotingResult<MethodReturn> {
        let mut state = lock(&self.state);

        loop {
            match mem::replace(&mut *state, CallState::Awaiting) {
                CallState::Replied(ret) => return Ok(ret),
                CallState::Faulted(err) => return Err(err),
                CallState::Cancelled => return Err(RemotingError::LinkDown),
                _ => {
                    state = match self.cond.wait(state) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
            }
        }
    }
}

pub struct ClientInterceptor {
    peer: String,
    link: Arc<Link>,
    registry: Arc<InstanceRegistry>,
    sequence: AtomicI32,
    pending: Mutex<HashMap<i32, Arc<CallContext>>>,
    policy: CallPolicy,
    gc_trigger: Arc<GcTrigger>,
    log: Logger,
}

impl ClientInterceptor {
    pub fn new(
        peer: String,
        link: Arc<Link>,
        registry: Arc<InstanceRegistry>,
        first_sequence: i32,
        policy: CallPolicy,
        gc_trigger: Arc<GcTrigger>,
        log: &Logger,
    ) -> ClientInterceptor {
        ClientInterceptor {
            log: log.new(logging::o!("peer" => peer.clone())),
            peer,
            link,
            registry,
            sequence: AtomicI32::new(first_sequence),
            pending: Mutex::new(HashMap::new()),
            policy,
            gc_trigger,
        }
    }

    #[inline]
    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    #[inline]
    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    #[inline]
    fn next_sequence(&self) -> i32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn register_pending(&self, sequence: i32) -> Arc<CallContext> {
        let ctx = Arc::new(CallContext::new(sequence));
        lock(&self.pending).insert(sequence, ctx.clone());
        ctx
    }

    fn forget(&self, sequence: i32) {
        lock(&self.pending).remove(&sequence);
    }

    fn take_pending(&self, sequence: i32) -> Option<Arc<CallContext>> {
        lock(&self.pending).remove(&sequence)
    }

    /// Cancel every outstanding call with a link-down outcome.
    pub fn cancel_all(&self) {
        let contexts: Vec<_> = lock(&self.pending).drain().map(|(_, ctx)| ctx).collect();
        for ctx in contexts {
            ctx.cancel();
        }
    }

    /// Calls that must not leave the process: the finaliser flavour of
    /// `dispose`, and `to_string` unless the policy opts it in.
    fn intercept_locally(
        &self,
        target: &ObjectId,
        invocation: &MethodInvocation,
    ) -> RemotingResult<Option<MethodReturn>> {
        let name = invocation.method.simple_name();

        if name == "to_string" && !self.policy.remote_to_string {
            let placeholder = format!("{{remote {}}}", target);
            return Ok(Some(MethodReturn::single(CallArg::serialize(&placeholder)?)));
        }

        if name == "dispose" {
            if let Some(first) = invocation.args.first() {
                if let Ok(false) = first.get::<bool>() {
                    return Ok(Some(MethodReturn::empty()));
                }
            }
        }

        Ok(None)
    }

    /// Execute a remote method call end to end: allocate a sequence, write
    /// the request, block until the receiver delivers the reply, surface
    /// faults as errors.
    pub fn invoke_remote(
        &self,
        target: &ObjectId,
        declaring_type: &str,
        invocation: MethodInvocation,
    ) -> RemotingResult<MethodReturn> {
        if let Some(short_circuit) = self.intercept_locally(target, &invocation)? {
            return Ok(short_circuit);
        }

        self.gc_trigger.bump_call();

        let swallow_link_down = invocation.method.simple_name() == TERMINATE_SERVICE_METHOD;
        let sequence = self.next_sequence();
        let ctx = self.register_pending(sequence);

        logging::trace!(self.log, "sending method call";
                        "sequence" => sequence,
                        "target" => %target,
                        "method" => %invocation.method);

        let result = match self.transmit_call(sequence, target, declaring_type, &invocation) {
            Ok(()) => {
                ctx.mark_sent();
                ctx.wait()
            }
            Err(RemotingError::Io(_)) => {
                // The stream is gone; everything pending dies with it.
                self.fail_link();
                Err(RemotingError::LinkDown)
            }
            Err(other) => Err(other),
        };
        self.forget(sequence);

        match result {
            Err(RemotingError::LinkDown) if swallow_link_down => Ok(MethodReturn::empty()),
            other => other,
        }
    }

    fn transmit_call(
        &self,
        sequence: i32,
        target: &ObjectId,
        declaring_type: &str,
        invocation: &MethodInvocation,
    ) -> RemotingResult<()> {
        let wire_ctx = WireContext {
            registry: &self.registry,
            peer: &self.peer,
            router: None,
        };

        let large = invocation.args.iter().any(|arg| match arg {
            CallArg::Data(payload) => payload.len() >= LARGE_BODY_THRESHOLD,
            _ => false,
        });

        if large {
            // The body would not fit a reasonable buffer: hold the link lock
            // across the whole write.
            self.link.transmit_with(|stream| {
                Self::write_call(stream, sequence, target, declaring_type, invocation, &wire_ctx)
            })
        } else {
            let mut frame = Vec::with_capacity(256);
            Self::write_call(
                &mut frame,
                sequence,
                target,
                declaring_type,
                invocation,
                &wire_ctx,
            )?;
            self.link.transmit(&frame)
        }
    }

    fn write_call(
        stream: &mut dyn Write,
        sequence: i32,
        target: &ObjectId,
        declaring_type: &str,
        invocation: &MethodInvocation,
        ctx: &WireContext,
    ) -> RemotingResult<()> {
        CallHeader::new(FunctionType::MethodCall, sequence).write(stream)?;
        wire::write_str(stream, target.as_str())?;
        wire::write_str(stream, declaring_type)?;
        wire::write_str(stream, invocation.method.as_str())?;
        wire::write_str_list(stream, &invocation.generic_args)?;
        envelope::encode_args(stream, &invocation.args, ctx)
    }

    /// Request instance construction on the peer. The reply carries the
    /// proxy reference as its single value.
    pub fn create_instance(
        &self,
        type_name: &str,
        args: Option<&[CallArg]>,
    ) -> RemotingResult<MethodReturn> {
        self.gc_trigger.bump_call();

        let sequence = self.next_sequence();
        let ctx = self.register_pending(sequence);
        let function = match args {
            Some(_) => FunctionType::CreateInstance,
            None => FunctionType::CreateInstanceWithDefaultCtor,
        };

        logging::debug!(self.log, "requesting instance";
                        "sequence" => sequence,
                        "type" => type_name);

        let wire_ctx = WireContext {
            registry: &self.registry,
            peer: &self.peer,
            router: None,
        };

        let result = (|| {
            let mut frame = Vec::with_capacity(128);
            CallHeader::new(function, sequence).write(&mut frame)?;
            wire::write_str(&mut frame, type_name)?;
            wire::write_str(&mut frame, "")?;
            frame.write_i32::<LittleEndian>(0)?; // constructor id
            frame.write_i32::<LittleEndian>(0)?; // generic argument count
            if let Some(args) = args {
                envelope::encode_args(&mut frame, args, &wire_ctx)?;
            }
            self.link.transmit(&frame)?;
            ctx.mark_sent();
            ctx.wait()
        })();
        self.forget(sequence);

        result
    }

    /// Announce the endpoint the peer should dial back for callbacks.
    pub fn announce_reverse_channel(&self, ip: &str, port: u16) -> RemotingResult<()> {
        let sequence = self.next_sequence();

        let mut frame = Vec::with_capacity(64);
        CallHeader::new(FunctionType::OpenReverseChannel, sequence).write(&mut frame)?;
        wire::write_str(&mut frame, ip)?;
        frame.write_i32::<LittleEndian>(i32::from(port))?;

        self.link.transmit(&frame)
    }

    /// Ask the peer to shut down. No reply is expected.
    pub fn send_shutdown_server(&self) -> RemotingResult<()> {
        let mut frame = Vec::with_capacity(8);
        CallHeader::new(FunctionType::ShutdownServer, self.next_sequence()).write(&mut frame)?;
        self.link.transmit(&frame)
    }

    /// Fail the link: fire the terminator, stop the collector, cancel every
    /// pending call.
    pub fn fail_link(&self) {
        if self.link.terminator().fire() {
            logging::debug!(self.log, "link terminator fired");
        }
        self.gc_trigger.shutdown();
        self.cancel_all();
    }

    fn deliver(&self, sequence: i32, outcome: Result<MethodReturn, RemotingError>) -> bool {
        match self.take_pending(sequence) {
            Some(ctx) => {
                match outcome {
                    Ok(ret) => ctx.complete(ret),
                    Err(err) => ctx.fault(err),
                }
                true
            }
            None => {
                logging::error!(self.log, "reply for unknown sequence";
                                "sequence" => sequence);
                false
            }
        }
    }

    /// Reply pump for the link. Reads frames until the stream dies, the
    /// peer announces shutdown, or the protocol desynchronises; all of those
    /// fail every pending call with link-down.
    pub fn run_receiver(self: Arc<Self>, reader: TcpStream) {
        let mut stream = BufReader::new(reader);
        let router: Arc<dyn CallRouter> = self.clone();

        logging::debug!(self.log, "receiver started");

        loop {
            let header = match CallHeader::read(&mut stream) {
                Ok(header) => header,
                Err(err) => {
                    logging::debug!(self.log, "link closed"; "error" => ?err);
                    break;
                }
            };

            match header.function {
                FunctionType::MethodReply => {
                    let wire_ctx = WireContext {
                        registry: &self.registry,
                        peer: &self.peer,
                        router: Some(&router),
                    };
                    match envelope::decode_args(&mut stream, &wire_ctx) {
                        Ok(values) => {
                            if !self.deliver(header.sequence, Ok(MethodReturn { values })) {
                                break;
                            }
                        }
                        Err(err) => {
                            logging::error!(self.log, "reply decode failed";
                                            "sequence" => header.sequence,
                                            "error" => ?err);
                            break;
                        }
                    }
                }
                FunctionType::ExceptionReturn => {
                    let fault = match Self::read_fault(&mut stream) {
                        Ok(fault) => fault,
                        Err(err) => {
                            logging::error!(self.log, "fault decode failed"; "error" => ?err);
                            break;
                        }
                    };
                    if !self.deliver(header.sequence, Err(fault.into_error())) {
                        break;
                    }
                }
                FunctionType::ServerShuttingDown => {
                    logging::info!(self.log, "peer is shutting down");
                    break;
                }
                other => {
                    logging::error!(self.log, "unexpected frame on reply link";
                                    "function" => ?other);
                    break;
                }
            }
        }

        self.fail_link();
        logging::debug!(self.log, "receiver stopped");
    }

    fn read_fault(stream: &mut BufReader<TcpStream>) -> RemotingResult<RemoteFault> {
        let exception_type = wire::read_str(stream)?;
        let message = wire::read_str(stream)?;
        let payload = wire::read_blob(stream)?;

        Ok(RemoteFault {
            exception_type,
            message,
            payload,
        })
    }
}

impl CallRouter for ClientInterceptor {
    fn peer_id(&self) -> &str {
        &self.peer
    }

    fn invoke(
        &self,
        target: &ObjectId,
        declaring_type: &str,
        invocation: MethodInvocation,
    ) -> RemotingResult<MethodReturn> {
        self.invoke_remote(target, declaring_type, invocation)
    }

    fn send_gc_cleanup(&self, ids: &[ObjectId]) -> RemotingResult<()> {
        let mut frame = Vec::with_capacity(64);
        CallHeader::new(FunctionType::GcCleanup, self.next_sequence()).write(&mut frame)?;
        frame.write_i32::<LittleEndian>(ids.len() as i32)?;
        for id in ids {
            wire::write_str(&mut frame, id.as_str())?;
        }

        self.link.transmit(&frame)
    }
}
