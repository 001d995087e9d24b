//! Client endpoint assembly: the forward link, the reverse-channel listener
//! and worker, the reply receiver and the memory collector.

use crate::dispatcher::{ConnectionWorker, DispatchHost, NullEvents};
use crate::error::{RemotingError, RemotingResult};
use crate::gc::{GcTrigger, MemoryCollector};
use crate::interceptor::{CallPolicy, ClientInterceptor, CLIENT_SEQUENCE_START};
use crate::link::{Link, Terminator};
use crate::logging::{self, Logger};
use crate::object::RemoteRef;
use crate::proxy::CallRouter;
use crate::registry::InstanceRegistry;
use crate::value::CallArg;
use crate::RemotingContext;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;

pub struct ClientConfig {
    /// Port of the reverse-channel listener; an ephemeral port is chosen
    /// when unset and announced in `OpenReverseChannel`.
    pub reverse_port: Option<u16>,
    pub policy: CallPolicy,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            reverse_port: None,
            policy: CallPolicy::default(),
        }
    }
}

pub struct RemotingClient {
    interceptor: Arc<ClientInterceptor>,
    link: Arc<Link>,
    registry: Arc<InstanceRegistry>,
    gc_trigger: Arc<GcTrigger>,
    collector: Option<thread::JoinHandle<()>>,
    receiver: Option<thread::JoinHandle<()>>,
    log: Logger,
}

impl RemotingClient {
    /// Connect to a server: open the forward link, announce and accept the
    /// reverse channel, then start the receiver and collector threads.
    pub fn connect<'a, A, L>(
        context: &RemotingContext,
        address: A,
        config: ClientConfig,
        log: L,
    ) -> RemotingResult<RemotingClient>
    where
        A: ToSocketAddrs,
        L: Into<Option<&'a Logger>>,
    {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        let stream = TcpStream::connect(address)?;
        let terminator = Arc::new(Terminator::new());
        let (link, read_half) = Link::new(stream, terminator, &log)?;
        let peer = link.peer_addr().to_string();

        logging::info!(log, "connected"; "peer" => &peer);

        let gc_trigger = Arc::new(GcTrigger::new());
        let interceptor = Arc::new(ClientInterceptor::new(
            peer,
            link.clone(),
            context.registry().clone(),
            CLIENT_SEQUENCE_START,
            config.policy.clone(),
            gc_trigger.clone(),
            &log,
        ));

        // Reverse channel: listen next to the forward link, announce the
        // port, then take the server's dial-back and run a dispatch worker
        // on it so callbacks have somewhere to land.
        let reverse_ip = link.local_addr().ip();
        let reverse_listener =
            TcpListener::bind((reverse_ip, config.reverse_port.unwrap_or(0)))?;
        let reverse_port = reverse_listener.local_addr()?.port();

        interceptor.announce_reverse_channel(&reverse_ip.to_string(), reverse_port)?;
        let (reverse_stream, reverse_peer) = reverse_listener.accept()?;

        logging::debug!(log, "reverse channel established";
                        "port" => reverse_port,
                        "peer" => reverse_peer.to_string());

        let host = DispatchHost {
            registry: context.registry().clone(),
            services: context.services().clone(),
            policy: config.policy,
            log: log.new(logging::o!("channel" => "reverse")),
        };
        let worker = ConnectionWorker::from_parts(
            host,
            reverse_stream,
            Arc::new(NullEvents),
            link.terminator().clone(),
        )?;
        thread::Builder::new()
            .name("reverse-worker".to_string())
            .spawn(move || worker.run())?;

        let receiver = {
            let interceptor = interceptor.clone();
            thread::Builder::new()
                .name("receiver".to_string())
                .spawn(move || interceptor.run_receiver(read_half))?
        };

        let router: Arc<dyn CallRouter> = interceptor.clone();
        let collector = MemoryCollector::spawn(
            context.registry().clone(),
            router,
            gc_trigger.clone(),
            &log,
        )?;

        Ok(RemotingClient {
            interceptor,
            link,
            registry: context.registry().clone(),
            gc_trigger,
            collector: Some(collector),
            receiver: Some(receiver),
            log,
        })
    }

    /// Construct an instance on the server through its default constructor
    /// and return the proxy for it.
    pub fn create_remote_instance(&self, type_name: &str) -> RemotingResult<RemoteRef> {
        let reply = self.interceptor.create_instance(type_name, None)?;
        reply
            .value()
            .and_then(|value| value.object())
            .ok_or_else(|| RemotingError::Protocol("create reply carried no proxy".to_string()))
    }

    /// Construct an instance through a matching constructor.
    pub fn create_remote_instance_with(
        &self,
        type_name: &str,
        args: &[CallArg],
    ) -> RemotingResult<RemoteRef> {
        let reply = self.interceptor.create_instance(type_name, Some(args))?;
        reply
            .value()
            .and_then(|value| value.object())
            .ok_or_else(|| RemotingError::Protocol("create reply carried no proxy".to_string()))
    }

    #[inline]
    pub fn interceptor(&self) -> &Arc<ClientInterceptor> {
        &self.interceptor
    }

    /// Provoke a garbage-collection sweep without waiting for the timer.
    #[inline]
    pub fn force_gc(&self) {
        self.gc_trigger.force();
    }

    /// Ask the server process to shut down. Link loss while the request is
    /// in flight is the expected outcome.
    pub fn shutdown_server(&self) -> RemotingResult<()> {
        logging::info!(self.log, "requesting server shutdown");

        match self.interceptor.send_shutdown_server() {
            Ok(()) | Err(RemotingError::LinkDown) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl Drop for RemotingClient {
    fn drop(&mut self) {
        // Final sweep first: report every proxy held on the server's behalf
        // while the link can still carry the cleanup frame.
        let router: Arc<dyn CallRouter> = self.interceptor.clone();
        let _ = self.registry.perform_gc(&router, true);

        self.gc_trigger.shutdown();
        if let Some(collector) = self.collector.take() {
            let _ = collector.join();
        }

        self.link.terminator().fire();
        self.interceptor.cancel_all();
        self.link.close();

        if let Some(receiver) = self.receiver.take() {
            let _ = receiver.join();
        }

        logging::debug!(self.log, "client closed");
    }
}
