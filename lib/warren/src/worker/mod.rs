//! The worker set: native threads with blocking I/O, one staging buffer per
//! worker, cooperative handoff over bounded rings when packet-filter workers
//! are configured.

pub mod inet;
pub mod node;
pub mod pf;
pub mod primary;
pub mod tun;

use crate::error::CoreError;
use crate::net::payload::PayloadBuf;
use crate::net::route::ROUTE_HEADER_SIZE;
use crate::pf::{InetOutcome, PfEnv, TunOutcome};
use crate::tun::TunDevice;
use crossbeam_channel::{bounded, Receiver, Sender};
use sett::logging;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How long blocking reads wait before rechecking the run flag.
pub(crate) const IO_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A worker: a named thread with a start/stop lifecycle.
pub trait Worker: Send {
    fn name(&self) -> &'static str;
    fn start(&mut self) -> Result<(), CoreError>;
    /// Lowers the run flag and joins the thread. Idempotent.
    fn stop(&mut self);
}

/// Thread handle shared by every worker implementation.
pub(crate) struct WorkerThread {
    name: &'static str,
    flag: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl WorkerThread {
    pub(crate) fn new(name: &'static str) -> WorkerThread {
        WorkerThread {
            name,
            flag: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub(crate) fn spawn<F>(&mut self, body: F) -> Result<(), CoreError>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        if self.handle.is_some() {
            return Err(CoreError::Resource(format!("worker {} already running", self.name)));
        }

        self.flag.store(true, Ordering::SeqCst);
        let flag = self.flag.clone();

        let handle = thread::Builder::new()
            .name(self.name.to_string())
            .spawn(move || body(flag))?;

        self.handle = Some(handle);
        Ok(())
    }

    pub(crate) fn stop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);

        if let Some(handle) = self.handle.take() {
            drop(handle.join());
        }
    }
}

#[inline]
pub(crate) fn running(flag: &AtomicBool) -> bool {
    flag.load(Ordering::SeqCst)
}

/// A bound UDP socket with an explicit open/closed state. UDP has no
/// `shutdown`, so `close` flips the flag exactly once and every I/O entry
/// point refuses afterwards; the descriptor itself goes away with the last
/// `Arc`.
pub struct UdpEndpoint {
    socket: UdpSocket,
    open: AtomicBool,
}

impl UdpEndpoint {
    pub fn new(socket: UdpSocket) -> UdpEndpoint {
        UdpEndpoint {
            socket,
            open: AtomicBool::new(true),
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Marks the endpoint closed. Only the first call transitions the state.
    pub fn close(&self) -> bool {
        self.open.swap(false, Ordering::SeqCst)
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        if !self.is_open() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed"));
        }

        self.socket.recv_from(buf)
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if !self.is_open() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed"));
        }

        self.socket.send_to(buf, addr)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// The I/O endpoints shared by the datapath workers. Sending walks the
/// per-family socket arrays round-robin.
pub struct DataPlane {
    pub tun: Arc<dyn TunDevice + Send + Sync>,
    sockets4: Vec<Arc<UdpEndpoint>>,
    sockets6: Vec<Arc<UdpEndpoint>>,
    cursor4: AtomicUsize,
    cursor6: AtomicUsize,
}

impl DataPlane {
    pub fn new(
        tun: Arc<dyn TunDevice + Send + Sync>,
        sockets4: Vec<Arc<UdpEndpoint>>,
        sockets6: Vec<Arc<UdpEndpoint>>,
    ) -> DataPlane {
        DataPlane {
            tun,
            sockets4,
            sockets6,
            cursor4: AtomicUsize::new(0),
            cursor6: AtomicUsize::new(0),
        }
    }

    pub fn sockets4(&self) -> &[Arc<UdpEndpoint>] {
        &self.sockets4
    }

    pub fn sockets6(&self) -> &[Arc<UdpEndpoint>] {
        &self.sockets6
    }

    /// Closes every socket of both families. Each closes exactly once.
    pub fn close_sockets(&self) {
        for socket in self.sockets4.iter().chain(self.sockets6.iter()) {
            socket.close();
        }
    }

    pub fn send_udp(&self, addr: SocketAddr, wire: &[u8]) -> io::Result<usize> {
        let (sockets, cursor) = match addr {
            SocketAddr::V4(_) => (&self.sockets4, &self.cursor4),
            SocketAddr::V6(_) => (&self.sockets6, &self.cursor6),
        };

        if sockets.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no socket for address family",
            ));
        }

        let socket = &sockets[cursor.fetch_add(1, Ordering::Relaxed) % sockets.len()];
        socket.send_to(wire, addr)
    }
}

/// An endpoint observation on its way to the node worker, the single writer
/// of node endpoint state.
#[derive(Debug, Copy, Clone)]
pub struct Observation {
    pub uuid: u64,
    pub addr: SocketAddr,
    pub now_sec: u64,
}

/// One unit of work handed to a packet-filter worker.
pub enum PfJob {
    Egress { buf: PayloadBuf },
    Ingress { buf: PayloadBuf, source: SocketAddr },
}

/// Bounded handoff ring plus the staging-buffer freelist feeding it.
#[derive(Clone)]
pub struct PfRing {
    pub jobs_tx: Sender<PfJob>,
    pub jobs_rx: Receiver<PfJob>,
    pub pool_tx: Sender<PayloadBuf>,
    pub pool_rx: Receiver<PayloadBuf>,
}

impl PfRing {
    pub fn new(depth: usize, buf_capacity: usize) -> PfRing {
        let (jobs_tx, jobs_rx) = bounded(depth);
        let (pool_tx, pool_rx) = bounded(depth);

        for _ in 0..depth {
            drop(pool_tx.send(PayloadBuf::new(buf_capacity)));
        }

        PfRing {
            jobs_tx,
            jobs_rx,
            pool_tx,
            pool_rx,
        }
    }
}

/// Copies a staged datagram into a pool buffer and enqueues it on the ring.
/// `source` distinguishes ingress jobs from egress jobs. Pool and ring are
/// bounded; every wait polls the run flag so shutdown never hangs here.
pub(crate) fn ring_handoff(
    env: &PfEnv,
    ring: &PfRing,
    staging: &PayloadBuf,
    source: Option<SocketAddr>,
    flag: &AtomicBool,
) {
    let mut pooled = loop {
        match ring.pool_rx.recv_timeout(IO_POLL_INTERVAL) {
            Ok(buf) => break buf,
            Err(_) if running(flag) => continue,
            Err(_) => return,
        }
    };

    if pooled.install(staging.wire()).is_err() {
        env.ctl.status.framing_drop_frames.fetch_add(1, Ordering::Relaxed);
        drop(ring.pool_tx.try_send(pooled));
        return;
    }

    let mut job = match source {
        Some(source) => PfJob::Ingress { buf: pooled, source },
        None => PfJob::Egress { buf: pooled },
    };

    loop {
        match ring.jobs_tx.send_timeout(job, IO_POLL_INTERVAL) {
            Ok(()) => return,
            Err(err) if running(flag) => {
                job = err.into_inner();
            }
            Err(err) => {
                // Shutting down: give the buffer back to the pool.
                let (PfJob::Egress { buf } | PfJob::Ingress { buf, .. }) = err.into_inner();
                drop(ring.pool_tx.try_send(buf));
                return;
            }
        }
    }
}

/// Finishes one egress cycle: transmit on `Emit`, nothing otherwise (the
/// chain already accounted for drops).
pub(crate) fn complete_egress(env: &PfEnv, plane: &DataPlane, buf: &PayloadBuf, outcome: TunOutcome) {
    if let TunOutcome::Emit(addr) = outcome {
        match plane.send_udp(addr, buf.wire()) {
            Ok(_) => {
                env.ctl.status.inet_tx_frames.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                logging::debug!(env.log, "udp send failed"; "addr" => %addr, "error" => %err);
            }
        }
    }
}

/// Finishes one ingress cycle: deliver terminal frames to the tun device,
/// retransmit transit frames.
pub(crate) fn complete_ingress(env: &PfEnv, plane: &DataPlane, buf: &PayloadBuf, outcome: InetOutcome) {
    match outcome {
        InetOutcome::Deliver => {
            if buf.body_len() < ROUTE_HEADER_SIZE {
                env.ctl.status.framing_drop_frames.fetch_add(1, Ordering::Relaxed);
                return;
            }

            match plane.tun.write(&buf.body()[ROUTE_HEADER_SIZE..]) {
                Ok(_) => {
                    env.ctl.status.tun_tx_frames.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    logging::debug!(env.log, "tun write failed"; "error" => %err);
                    env.ctl.status.drop_frames.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        InetOutcome::Emit(addr) => match plane.send_udp(addr, buf.wire()) {
            Ok(_) => {
                env.ctl.status.inet_tx_frames.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                logging::debug!(env.log, "udp send failed"; "addr" => %addr, "error" => %err);
            }
        },
        InetOutcome::Dropped(_) => (),
    }
}
