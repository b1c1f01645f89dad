use crate::error::CoreError;
use crate::net::payload::{PayloadBuf, PayloadType};
use crate::node::Reachability;
use crate::pf::PfEnv;
use crate::worker::{running, DataPlane, Observation, Worker, WorkerThread, IO_POLL_INTERVAL};
use byteorder::{BigEndian, ByteOrder};
use crossbeam_channel::Receiver;
use sett::logging;
use sett::time::timestamp_secs;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Node worker: the single writer of node endpoint state. Applies endpoint
/// observations queued by the ingress workers, sends keep-alive pings and
/// ages out reachability for peers that went quiet. Discovery against the
/// index service is a separate concern and lives outside the datapath.
pub struct NodeWorker {
    thread: WorkerThread,
    env: PfEnv,
    plane: Arc<DataPlane>,
    observations: Receiver<Observation>,
}

impl NodeWorker {
    pub fn new(env: PfEnv, plane: Arc<DataPlane>, observations: Receiver<Observation>) -> NodeWorker {
        NodeWorker {
            thread: WorkerThread::new("node_worker"),
            env,
            plane,
            observations,
        }
    }
}

impl Worker for NodeWorker {
    fn name(&self) -> &'static str {
        "node_worker"
    }

    fn start(&mut self) -> Result<(), CoreError> {
        let env = self.env.clone();
        let plane = self.plane.clone();
        let observations = self.observations.clone();

        self.thread.spawn(move |flag| run(env, plane, observations, flag))
    }

    fn stop(&mut self) {
        self.thread.stop();
    }
}

fn run(env: PfEnv, plane: Arc<DataPlane>, observations: Receiver<Observation>, flag: Arc<AtomicBool>) {
    let mut staging = PayloadBuf::new(env.conf.payload_block_size);
    let mut last_ping = Instant::now() - PING_INTERVAL;

    logging::debug!(env.log, "node worker running");

    while running(&flag) {
        match observations.recv_timeout(IO_POLL_INTERVAL) {
            Ok(observation) => {
                logging::trace!(env.log, "endpoint observation";
                                "uuid" => observation.uuid,
                                "addr" => %observation.addr);
                env.ctl
                    .registry
                    .record_observation(observation.uuid, observation.addr, observation.now_sec);
            }
            Err(_) => (),
        }

        if last_ping.elapsed() >= PING_INTERVAL {
            last_ping = Instant::now();
            let now_sec = timestamp_secs();

            keepalive_sweep(&env, &plane, &mut staging, now_sec);
            age_reachability(&env, now_sec);
        }
    }
}

/// Sends one keep-alive ping to every peer with a known endpoint.
fn keepalive_sweep(env: &PfEnv, plane: &DataPlane, staging: &mut PayloadBuf, now_sec: u64) {
    let local_uuid = env.ctl.core.local_uuid;
    let window = env.conf.liveness_window_sec;

    for node in env.ctl.registry.iter() {
        if node.uuid == local_uuid {
            continue;
        }

        let addr = match node.pick_endpoint(now_sec, window) {
            Some(addr) => addr,
            None => continue,
        };

        staging.reset();
        staging.set_header(PayloadType::Ping, 0);

        {
            let body = staging.body_space_mut();
            BigEndian::write_u64(&mut body[0..], local_uuid);
            BigEndian::write_u64(&mut body[8..], now_sec);
        }

        if staging.set_body_len(16).is_err() {
            continue;
        }

        if let Err(err) = plane.send_udp(addr, staging.wire()) {
            logging::trace!(env.log, "keep-alive send failed"; "addr" => %addr, "error" => %err);
        }
    }
}

/// Downgrades reachability for peers not seen for several liveness windows.
fn age_reachability(env: &PfEnv, now_sec: u64) {
    let window = env.conf.liveness_window_sec;

    for node in env.ctl.registry.iter() {
        if node.uuid == env.ctl.core.local_uuid {
            continue;
        }

        let last_seen = node.last_seen_sec();

        if last_seen > 0
            && node.reachability() == Reachability::Direct
            && now_sec.saturating_sub(last_seen) > window * 3
        {
            logging::debug!(env.log, "peer went quiet"; "uuid" => node.uuid);
            node.set_reachability(Reachability::Unknown);
        }
    }
}
