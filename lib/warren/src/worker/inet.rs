use crate::error::CoreError;
use crate::net::payload::{PayloadBuf, PayloadType};
use crate::pf::{PfChain, PfEnv};
use crate::worker::{
    complete_ingress, ring_handoff, running, DataPlane, Observation, PfRing, UdpEndpoint, Worker,
    WorkerThread,
};
use byteorder::{BigEndian, ByteOrder};
use crossbeam_channel::Sender;
use sett::logging;
use sett::time::timestamp_secs;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Ingress worker: one per UDP socket. Reads datagrams, dispatches by
/// envelope type and drives `IpFrame` traffic through the inet chains.
pub struct InetWorker {
    thread: WorkerThread,
    socket: Arc<UdpEndpoint>,
    env: PfEnv,
    plane: Arc<DataPlane>,
    ring: Option<PfRing>,
    observations: Sender<Observation>,
}

impl InetWorker {
    pub fn new(
        socket: Arc<UdpEndpoint>,
        env: PfEnv,
        plane: Arc<DataPlane>,
        ring: Option<PfRing>,
        observations: Sender<Observation>,
    ) -> InetWorker {
        InetWorker {
            thread: WorkerThread::new("inet_worker"),
            socket,
            env,
            plane,
            ring,
            observations,
        }
    }
}

impl Worker for InetWorker {
    fn name(&self) -> &'static str {
        "inet_worker"
    }

    fn start(&mut self) -> Result<(), CoreError> {
        let socket = self.socket.clone();
        let env = self.env.clone();
        let plane = self.plane.clone();
        let ring = self.ring.clone();
        let observations = self.observations.clone();

        self.thread
            .spawn(move |flag| run(socket, env, plane, ring, observations, flag))
    }

    fn stop(&mut self) {
        self.thread.stop();
    }
}

fn run(
    socket: Arc<UdpEndpoint>,
    env: PfEnv,
    plane: Arc<DataPlane>,
    ring: Option<PfRing>,
    observations: Sender<Observation>,
    flag: Arc<AtomicBool>,
) {
    let mut chain = PfChain::standard();
    chain.configure(&env);

    let mut staging = PayloadBuf::new(env.conf.payload_block_size);

    logging::debug!(env.log, "inet worker running";
                    "local" => %socket.local_addr().map(|a| a.to_string()).unwrap_or_default());

    while running(&flag) {
        if !socket.is_open() {
            logging::debug!(env.log, "socket closed, draining");
            break;
        }

        let (received, source) = match socket.recv_from(staging.recv_space_mut()) {
            Ok(result) => result,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::TimedOut => {
                continue;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == io::ErrorKind::NotConnected => {
                logging::debug!(env.log, "socket closed, draining");
                break;
            }
            Err(err) => {
                logging::error!(env.log, "udp recv failed"; "error" => %err);
                continue;
            }
        };

        env.ctl.status.inet_rx_frames.fetch_add(1, Ordering::Relaxed);

        let (type_byte, _) = match staging.commit_recv(received) {
            Ok(header) => header,
            Err(err) => {
                logging::trace!(env.log, "framing error"; "error" => ?err, "source" => %source);
                env.ctl.status.framing_drop_frames.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        match PayloadType::from_u8(type_byte) {
            Some(PayloadType::IpFrame) => match &ring {
                Some(ring) => ring_handoff(&env, ring, &staging, Some(source), &flag),
                None => {
                    let outcome = chain.run_inet(&env, &mut staging, source);
                    complete_ingress(&env, &plane, &staging, outcome);
                }
            },
            Some(PayloadType::Ping) => {
                env.ctl.status.ping_rx_frames.fetch_add(1, Ordering::Relaxed);

                if staging.body_len() >= 16 {
                    let uuid = BigEndian::read_u64(staging.body());
                    drop(observations.try_send(Observation {
                        uuid,
                        addr: source,
                        now_sec: timestamp_secs(),
                    }));
                }
            }
            // Discovery, detection and log transport belong to their own
            // workers; the datapath only counts them.
            Some(PayloadType::Index) | Some(PayloadType::Detect) | Some(PayloadType::UdpLog) => (),
            None => {
                logging::trace!(env.log, "unknown payload type"; "type" => type_byte, "source" => %source);
                env.ctl.status.framing_drop_frames.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    chain.release(&env);
}
