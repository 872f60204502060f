use std::{
    collections::HashMap,
    io::{self, Read, Write},
    net::{Shutdown, TcpListener, TcpStream},
    os::unix::net::{UnixListener, UnixStream},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
};

use parking_lot::Mutex;
use rumpsp::{
    read_request, sysno::errno, unpack_args, write_response, Handshake, Request, Response,
    ServerAddr,
};
use tracing::{debug, error, trace, warn};

use crate::{ProcTable, ServerConfig, ServerError};

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    fn bind(addr: &ServerAddr) -> io::Result<Self> {
        Ok(match addr {
            ServerAddr::Unix(path) => Listener::Unix(UnixListener::bind(path)?),
            ServerAddr::Tcp(hostport) => Listener::Tcp(TcpListener::bind(hostport.as_str())?),
        })
    }

    fn accept(&self) -> io::Result<Conn> {
        Ok(match self {
            Listener::Unix(l) => Conn::Unix(l.accept()?.0),
            Listener::Tcp(l) => {
                let (stream, _) = l.accept()?;
                stream.set_nodelay(true)?;
                Conn::Tcp(stream)
            }
        })
    }

    /// The address clients should dial, with any wildcard port resolved.
    fn local_addr(&self, requested: &ServerAddr) -> io::Result<ServerAddr> {
        Ok(match self {
            Listener::Unix(_) => requested.clone(),
            Listener::Tcp(l) => ServerAddr::Tcp(l.local_addr()?.to_string()),
        })
    }
}

enum Conn {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Conn {
    fn try_clone(&self) -> io::Result<Self> {
        Ok(match self {
            Conn::Unix(s) => Conn::Unix(s.try_clone()?),
            Conn::Tcp(s) => Conn::Tcp(s.try_clone()?),
        })
    }

    fn shutdown(&self) {
        let _ = match self {
            Conn::Unix(s) => s.shutdown(Shutdown::Both),
            Conn::Tcp(s) => s.shutdown(Shutdown::Both),
        };
    }
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Conn::Unix(s) => s.read(buf),
            Conn::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Conn::Unix(s) => s.write(buf),
            Conn::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Conn::Unix(s) => s.flush(),
            Conn::Tcp(s) => s.flush(),
        }
    }
}

struct Shared {
    procs: Mutex<ProcTable>,
    conns: Mutex<HashMap<u64, Conn>>,
    next_conn: AtomicU64,
}

impl Shared {
    fn handle(&self, bound: &mut Option<u32>, req: Request) -> Response {
        let mut procs = self.procs.lock();
        let result = match (req, *bound) {
            (Request::Handshake(hs), None) => {
                let res = match hs {
                    Handshake::Guest { comm } => procs.guest(comm),
                    Handshake::Attach(cookie) => procs.attach(&cookie),
                    Handshake::Fork(cookie) => procs.fork(&cookie),
                    // Only a channel that already belongs to a process can announce an exec.
                    Handshake::Exec { .. } => Err(errno::EINVAL),
                };
                res.map(|(pid, cookie)| {
                    *bound = Some(pid);
                    Response::Handshake { pid, cookie }
                })
            }
            (Request::Handshake(Handshake::Exec { comm }), Some(pid)) => procs
                .exec(pid, comm)
                .map(|(pid, cookie)| Response::Handshake { pid, cookie }),
            (Request::Handshake(_), Some(_)) | (_, None) => Err(errno::EINVAL),
            (Request::Syscall { nr, args }, Some(pid)) => {
                Ok(procs.syscall(pid, nr, &unpack_args(&args)))
            }
            (Request::Prefork, Some(pid)) => procs.prefork(pid).map(Response::Prefork),
            (Request::ForkCancel(cookie), Some(pid)) => {
                procs.cancel_fork(pid, &cookie).map(|()| Response::Done)
            }
        };
        result.unwrap_or_else(Response::Error)
    }
}

fn serve_channel(shared: Arc<Shared>, id: u64, mut conn: Conn) {
    let mut bound = None;
    loop {
        let (reqno, req) = match read_request(&mut conn) {
            Ok(r) => r,
            Err(e) if e.is_transport() => break,
            Err(e) => {
                warn!("channel {}: {}", id, e);
                break;
            }
        };
        let kind = req.kind();
        let resp = shared.handle(&mut bound, req);
        if let Err(e) = write_response(&mut conn, reqno, kind, &resp) {
            debug!("channel {}: {}", id, e);
            break;
        }
    }

    if let Some(pid) = bound {
        shared.procs.lock().detach(pid);
    }
    shared.conns.lock().remove(&id);
    trace!("channel {} closed", id);
}

fn start_channel(shared: &Arc<Shared>, conn: Conn) {
    let id = shared.next_conn.fetch_add(1, Ordering::Relaxed);
    match conn.try_clone() {
        Ok(c) => {
            shared.conns.lock().insert(id, c);
        }
        Err(e) => {
            warn!("channel {}: {}", id, e);
            return;
        }
    }

    let worker = shared.clone();
    let spawned = thread::Builder::new()
        .name(format!("rumpsp-chan-{}", id))
        .spawn(move || serve_channel(worker, id, conn));
    if let Err(e) = spawned {
        warn!("failed to start channel thread: {}", e);
        if let Some(c) = shared.conns.lock().remove(&id) {
            c.shutdown();
        }
    }
}

/// Cheap handle onto a running server's state.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
    addr: ServerAddr,
}

impl ServerHandle {
    pub fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    pub fn process_count(&self) -> usize {
        self.shared.procs.lock().len()
    }

    pub fn pending_forks(&self) -> usize {
        self.shared.procs.lock().pending_forks()
    }

    pub fn cancelled_forks(&self) -> usize {
        self.shared.procs.lock().cancelled_forks()
    }

    pub fn comm_of(&self, pid: u32) -> Option<String> {
        self.shared.procs.lock().get(pid).map(|p| p.comm.clone())
    }

    /// Shut down every open channel from the server side, as if the kernel had gone away.
    pub fn disconnect_all(&self) {
        let conns = self.shared.conns.lock();
        debug!("disconnecting {} channels", conns.len());
        for conn in conns.values() {
            conn.shutdown();
        }
    }
}

pub struct RumpServer {
    listener: Listener,
    handle: ServerHandle,
}

impl RumpServer {
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let bind_err = |source| ServerError::Bind {
            addr: config.addr.to_string(),
            source,
        };
        let listener = Listener::bind(&config.addr).map_err(bind_err)?;
        let addr = listener.local_addr(&config.addr).map_err(bind_err)?;
        let shared = Arc::new(Shared {
            procs: Mutex::new(ProcTable::new(config.max_procs)),
            conns: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(0),
        });
        Ok(Self {
            listener,
            handle: ServerHandle { shared, addr },
        })
    }

    pub fn local_addr(&self) -> &ServerAddr {
        &self.handle.addr
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Accept channels until the listener fails.
    pub fn serve(self) -> Result<(), ServerError> {
        loop {
            match self.listener.accept() {
                Ok(conn) => start_channel(&self.handle.shared, conn),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept on {} failed: {}", self.handle.addr, e);
                    return Err(e.into());
                }
            }
        }
    }

    /// Run [RumpServer::serve] on a background thread.
    pub fn spawn(self) -> Result<ServerHandle, ServerError> {
        let handle = self.handle();
        thread::Builder::new()
            .name("rumpsp-listen".to_string())
            .spawn(move || {
                let _ = self.serve();
            })?;
        Ok(handle)
    }
}
