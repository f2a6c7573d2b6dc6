use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use log::{debug, error, info, warn};

use crate::replication::{self, Replication};
use crate::session::Session;
use crate::store::Store;

pub struct ServerOptions {
    pub port: u16,
    pub replicaof: Option<(String, u16)>,
}

impl Default for ServerOptions {
    fn default() -> ServerOptions {
        ServerOptions {
            port: 6379,
            replicaof: None,
        }
    }
}

/// Everything the connection threads share: the keyspace (with its waiter
/// table) and the replication state.
pub struct Shared {
    pub store: Store,
    pub repl: Replication,
}

pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Server {
    pub fn bind(opts: ServerOptions) -> anyhow::Result<Server> {
        let listener = TcpListener::bind(("127.0.0.1", opts.port))
            .with_context(|| format!("failed to bind port {}", opts.port))?;
        let repl = match opts.replicaof {
            Some((host, port)) => Replication::new_replica(host, port),
            None => Replication::new_master(),
        };
        Ok(Server {
            listener,
            shared: Arc::new(Shared {
                store: Store::default(),
                repl,
            }),
        })
    }

    /// The bound address; useful when binding port 0.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn run(self) -> anyhow::Result<()> {
        let own_port = self.local_addr()?.port();
        if self.shared.repl.is_replica() {
            let shared = self.shared.clone();
            thread::spawn(move || {
                if let Err(err) = replication::connect_master(shared, own_port) {
                    error!("master link failed: {err:#}");
                }
            });
        }
        info!("listening on port {own_port}");

        let mut socket_id: u64 = 0;
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let shared = self.shared.clone();
                    let id = socket_id;
                    debug!("accepted new connection socket {id}");
                    thread::spawn(move || match Session::new(stream, shared).run() {
                        Ok(()) => debug!("connection {id} closed"),
                        Err(err) => warn!("connection {id} dropped: {err:#}"),
                    });
                    socket_id += 1;
                }
                Err(err) => error!("accept failed: {err}"),
            }
        }
        Ok(())
    }
}
