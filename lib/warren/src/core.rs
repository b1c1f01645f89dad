use crate::conf::Conf;
use crate::ctl::CtlBlock;
use crate::error::CoreError;
use crate::pf::PfEnv;
use crate::registry::Registry;
use crate::tun::TunDevice;
use crate::worker::inet::InetWorker;
use crate::worker::node::NodeWorker;
use crate::worker::pf::PfWorker;
use crate::worker::primary::PrimaryWorker;
use crate::worker::tun::TunWorker;
use crate::worker::{DataPlane, Observation, PfRing, UdpEndpoint, Worker, IO_POLL_INTERVAL};
use crossbeam_channel::bounded;
use sett::keys::Identity;
use sett::logging::{self, Logger};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;

const OBSERVATION_QUEUE_DEPTH: usize = 1024;
const PF_RING_DEPTH_PER_WORKER: usize = 4;

/// The assembled engine: control block, I/O plane and worker set.
/// `create` wires everything, `start` brings the workers up in dependency
/// order, `stop` drains them; dropping a running core stops it.
pub struct Core {
    conf: Arc<Conf>,
    ctl: Arc<CtlBlock>,
    plane: Arc<DataPlane>,
    workers: Vec<Box<dyn Worker>>,
    log: Logger,
    running: bool,
}

impl Core {
    pub fn create(
        conf: Conf,
        identity: Identity,
        tun: Arc<dyn TunDevice + Send + Sync>,
    ) -> Result<Core, CoreError> {
        conf.validate()?;

        let conf = Arc::new(conf);
        let log_conf = conf.log_conf();
        let log = logging::worker_logger(&log_conf, "core", conf.core_log_level)?;

        let registry = Arc::new(Registry::build(&conf, &identity)?);
        let ctl = Arc::new(CtlBlock::new(conf.clone(), identity, registry));

        if conf.activate_tun {
            tun.init()?;
        }

        let sockets4 = bind_sockets4(&conf)?;
        let sockets6 = bind_sockets6(&conf)?;
        let plane = Arc::new(DataPlane::new(tun, sockets4, sockets6));

        let (obs_tx, obs_rx) = bounded::<Observation>(OBSERVATION_QUEUE_DEPTH);

        let ring = match conf.pf_worker_num {
            0 => None,
            n => Some(PfRing::new(n * PF_RING_DEPTH_PER_WORKER, conf.payload_block_size)),
        };

        let pf_env = PfEnv {
            conf: conf.clone(),
            ctl: ctl.clone(),
            log: logging::worker_logger(&log_conf, "pf", conf.pf_log_level)?,
        };

        let mut workers: Vec<Box<dyn Worker>> = Vec::new();

        if let Some(ring) = &ring {
            for _ in 0..conf.pf_worker_num {
                workers.push(Box::new(PfWorker::new(pf_env.clone(), plane.clone(), ring.clone())));
            }
        }

        for socket in plane.sockets4().iter().chain(plane.sockets6().iter()) {
            workers.push(Box::new(InetWorker::new(
                socket.clone(),
                pf_env.clone(),
                plane.clone(),
                ring.clone(),
                obs_tx.clone(),
            )));
        }

        if conf.activate_tun {
            workers.push(Box::new(TunWorker::new(pf_env.clone(), plane.clone(), ring.clone())));
        }

        if conf.activate_node_worker {
            let node_env = PfEnv {
                conf: conf.clone(),
                ctl: ctl.clone(),
                log: logging::worker_logger(&log_conf, "node", conf.node_log_level)?,
            };
            workers.push(Box::new(NodeWorker::new(node_env, plane.clone(), obs_rx)));
        }

        let main_log = logging::worker_logger(&log_conf, "main", conf.main_log_level)?;
        workers.push(Box::new(PrimaryWorker::new(ctl.clone(), main_log)));

        Ok(Core {
            conf,
            ctl,
            plane,
            workers,
            log,
            running: false,
        })
    }

    /// Opens the tun device and brings every worker up. The local node is
    /// pinned before any worker starts; that is a `create` invariant.
    pub fn start(&mut self) -> Result<(), CoreError> {
        if self.running {
            return Ok(());
        }

        if self.conf.activate_tun {
            self.plane.tun.open()?;
            logging::info!(self.log, "interface opened";
                           "ifname" => %self.ctl.core.ifname,
                           "node" => self.ctl.core.local_uuid,
                           "tun_addr4" => %self.ctl.registry.local().tun_addr4);
        }

        for worker in &mut self.workers {
            worker.start()?;
            logging::info!(self.log, "worker started"; "worker" => worker.name());
        }

        self.running = true;
        Ok(())
    }

    /// Drains the workers: datapath workers first, the primary last, then the
    /// sockets and the tun device are closed. The control block stays intact
    /// for diagnostics.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }

        let primary_idx = self.workers.len() - 1;

        for worker in &mut self.workers[..primary_idx] {
            worker.stop();
            logging::info!(self.log, "worker stopped"; "worker" => worker.name());
        }

        self.workers[primary_idx].stop();
        logging::info!(self.log, "worker stopped"; "worker" => self.workers[primary_idx].name());

        self.plane.close_sockets();
        logging::info!(self.log, "sockets closed";
                       "udp4" => self.plane.sockets4().len(),
                       "udp6" => self.plane.sockets6().len());

        self.plane.tun.close();
        logging::info!(self.log, "interface closed"; "ifname" => %self.ctl.core.ifname);

        self.running = false;
    }

    #[inline]
    pub fn conf(&self) -> &Arc<Conf> {
        &self.conf
    }

    #[inline]
    pub fn ctl(&self) -> &Arc<CtlBlock> {
        &self.ctl
    }

    /// Local address of the first IPv4 socket, once bound.
    pub fn local_udp4_addr(&self) -> Option<SocketAddr> {
        self.plane.sockets4().first().and_then(|s| s.local_addr().ok())
    }

    /// True while any UDP socket is still open; false after `stop()`.
    pub fn udp_open(&self) -> bool {
        self.plane
            .sockets4()
            .iter()
            .chain(self.plane.sockets6().iter())
            .any(|s| s.is_open())
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_sockets4(conf: &Conf) -> Result<Vec<Arc<UdpEndpoint>>, CoreError> {
    let mut sockets = Vec::with_capacity(conf.udp4_socket_num);

    for &port in conf.udp4_ports.iter().take(conf.udp4_socket_num) {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let socket = UdpSocket::bind(addr)
            .map_err(|err| CoreError::Resource(format!("udp4 bind {}: {}", addr, err)))?;
        socket.set_read_timeout(Some(IO_POLL_INTERVAL))?;
        sockets.push(Arc::new(UdpEndpoint::new(socket)));
    }

    Ok(sockets)
}

fn bind_sockets6(conf: &Conf) -> Result<Vec<Arc<UdpEndpoint>>, CoreError> {
    let mut sockets = Vec::with_capacity(conf.udp6_socket_num);

    for &port in conf.udp6_ports.iter().take(conf.udp6_socket_num) {
        let addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
        let socket = UdpSocket::bind(addr)
            .map_err(|err| CoreError::Resource(format!("udp6 bind {}: {}", addr, err)))?;
        socket.set_read_timeout(Some(IO_POLL_INTERVAL))?;
        sockets.push(Arc::new(UdpEndpoint::new(socket)));
    }

    Ok(sockets)
}
