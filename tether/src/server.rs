//! Server endpoint: owns the listening socket, spawns a worker per inbound
//! connection, and broadcasts `ServerShuttingDown` to every peer on the way
//! out.

use crate::dispatcher::{ConnectionWorker, DispatchHost, WorkerEvents};
use crate::error::RemotingResult;
use crate::interceptor::CallPolicy;
use crate::link::Link;
use crate::lock;
use crate::logging::{self, Logger};
use crate::wire::{CallHeader, FunctionType};
use crate::{RemotingContext, DEFAULT_PORT};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

pub struct ServerConfig {
    /// Bind address in `<ip>:<port>` form.
    pub address: String,
    /// Shut the endpoint down as soon as a client disconnects.
    pub kill_on_disconnect: bool,
    pub policy: CallPolicy,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            address: format!("0.0.0.0:{}", DEFAULT_PORT),
            kill_on_disconnect: false,
            policy: CallPolicy::default(),
        }
    }
}

struct ServerShared {
    links: Mutex<Vec<Arc<Link>>>,
    running: AtomicBool,
    local_addr: SocketAddr,
    kill_on_disconnect: bool,
    log: Logger,
}

impl ServerShared {
    fn initiate_shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        logging::info!(self.log, "server shutting down");

        let links: Vec<_> = lock(&self.links).clone();

        let mut frame = Vec::with_capacity(8);
        if CallHeader::new(FunctionType::ServerShuttingDown, 0)
            .write(&mut frame)
            .is_ok()
        {
            for link in &links {
                let _ = link.transmit(&frame);
            }
        }

        for link in &links {
            link.terminator().fire();
            link.close();
        }

        // Wake the accept loop.
        let wake = match self.local_addr.ip().is_unspecified() {
            true => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.local_addr.port()),
            false => self.local_addr,
        };
        let _ = TcpStream::connect(wake);
    }
}

impl WorkerEvents for ServerShared {
    fn shutdown_requested(&self) {
        self.initiate_shutdown();
    }

    fn connection_closed(&self, peer: &str) {
        logging::debug!(self.log, "client disconnected"; "peer" => peer);

        if self.kill_on_disconnect {
            logging::info!(self.log, "disconnect triggers shutdown"; "peer" => peer);
            self.initiate_shutdown();
        }
    }
}

pub struct RemotingServer {
    listener: TcpListener,
    host: DispatchHost,
    shared: Arc<ServerShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl RemotingServer {
    /// Bind the listening socket. Failure here is the socket-creation error
    /// a launcher reports separately from later start failures.
    pub fn bind<'a, L: Into<Option<&'a Logger>>>(
        context: &RemotingContext,
        config: ServerConfig,
        log: L,
    ) -> RemotingResult<RemotingServer> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        let listener = TcpListener::bind(&config.address)?;
        let local_addr = listener.local_addr()?;

        logging::info!(log, "listening"; "address" => local_addr.to_string());

        let host = DispatchHost {
            registry: context.registry().clone(),
            services: context.services().clone(),
            policy: config.policy,
            log: log.new(logging::o!()),
        };

        let shared = Arc::new(ServerShared {
            links: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            local_addr,
            kill_on_disconnect: config.kill_on_disconnect,
            log: log.new(logging::o!()),
        });

        Ok(RemotingServer {
            listener,
            host,
            shared,
            workers: Mutex::new(Vec::new()),
        })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Accept loop. Returns once shutdown was initiated and every worker has
    /// been joined.
    pub fn run(&self) -> RemotingResult<()> {
        while self.shared.running.load(Ordering::SeqCst) {
            let (stream, addr) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) => {
                    if !self.shared.running.load(Ordering::SeqCst) {
                        break;
                    }
                    logging::warn!(self.shared.log, "accept failed"; "error" => ?err);
                    continue;
                }
            };

            if !self.shared.running.load(Ordering::SeqCst) {
                // Shutdown wake-up connection.
                break;
            }

            logging::debug!(self.shared.log, "connection accepted"; "peer" => addr.to_string());

            let events: Arc<dyn WorkerEvents> = self.shared.clone();
            let worker = match ConnectionWorker::accept(self.host.clone(), stream, events) {
                Ok(worker) => worker,
                Err(err) => {
                    logging::warn!(self.shared.log, "worker setup failed"; "error" => ?err);
                    continue;
                }
            };

            lock(&self.shared.links).push(worker.link());

            match thread::Builder::new()
                .name(format!("worker-{}", addr))
                .spawn(move || worker.run())
            {
                Ok(handle) => lock(&self.workers).push(handle),
                Err(err) => {
                    logging::warn!(self.shared.log, "worker spawn failed"; "error" => ?err)
                }
            }
        }

        let handles: Vec<_> = lock(&self.workers).drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }

        logging::info!(self.shared.log, "server stopped");
        Ok(())
    }

    /// Initiate shutdown from outside the frame loop.
    pub fn shutdown(&self) {
        self.shared.initiate_shutdown();
    }
}
