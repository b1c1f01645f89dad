use crate::error::CoreError;
use crate::net::payload::{PayloadBuf, PayloadType};
use crate::net::route::ROUTE_HEADER_SIZE;
use crate::pf::{PfChain, PfEnv};
use crate::tun::TunError;
use crate::worker::{
    complete_egress, ring_handoff, running, DataPlane, PfRing, Worker, WorkerThread, IO_POLL_INTERVAL,
};
use sett::logging;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Egress worker: reads IP frames off the tun device and drives them through
/// the tun chains, or hands them to the packet-filter ring when one is
/// configured.
pub struct TunWorker {
    thread: WorkerThread,
    env: PfEnv,
    plane: Arc<DataPlane>,
    ring: Option<PfRing>,
}

impl TunWorker {
    pub fn new(env: PfEnv, plane: Arc<DataPlane>, ring: Option<PfRing>) -> TunWorker {
        TunWorker {
            thread: WorkerThread::new("tun_worker"),
            env,
            plane,
            ring,
        }
    }
}

impl Worker for TunWorker {
    fn name(&self) -> &'static str {
        "tun_worker"
    }

    fn start(&mut self) -> Result<(), CoreError> {
        let env = self.env.clone();
        let plane = self.plane.clone();
        let ring = self.ring.clone();

        self.thread.spawn(move |flag| run(env, plane, ring, flag))
    }

    fn stop(&mut self) {
        self.thread.stop();
    }
}

fn run(env: PfEnv, plane: Arc<DataPlane>, ring: Option<PfRing>, flag: Arc<AtomicBool>) {
    let mut chain = PfChain::standard();
    chain.configure(&env);

    let mut staging = PayloadBuf::new(env.conf.payload_block_size);
    let mtu = env.conf.mtu;

    logging::debug!(env.log, "tun worker running"; "mtu" => mtu);

    while running(&flag) {
        staging.reset();
        staging.set_header(PayloadType::IpFrame, 0);

        let frame_space = &mut staging.body_space_mut()[ROUTE_HEADER_SIZE..ROUTE_HEADER_SIZE + mtu];

        let frame_len = match plane.tun.read(frame_space, IO_POLL_INTERVAL) {
            Ok(0) | Err(TunError::TimedOut) => continue,
            Ok(n) => n,
            Err(TunError::Closed) => {
                logging::debug!(env.log, "tun device closed, draining");
                break;
            }
            Err(err) => {
                logging::error!(env.log, "tun read failed"; "error" => %err);
                continue;
            }
        };

        env.ctl.status.tun_rx_frames.fetch_add(1, Ordering::Relaxed);

        if staging.set_body_len(ROUTE_HEADER_SIZE + frame_len).is_err() {
            env.ctl.status.framing_drop_frames.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        match &ring {
            Some(ring) => ring_handoff(&env, ring, &staging, None, &flag),
            None => {
                let outcome = chain.run_tun(&env, &mut staging);
                complete_egress(&env, &plane, &staging, outcome);
            }
        }
    }

    chain.release(&env);
}
