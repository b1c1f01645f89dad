use crate::error::CoreError;
use crate::pf::{PfChain, PfEnv};
use crate::worker::{
    complete_egress, complete_ingress, running, DataPlane, PfJob, PfRing, Worker, WorkerThread,
    IO_POLL_INTERVAL,
};
use sett::logging;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Parallel packet-filter worker. Each owns a complete filter chain and
/// consumes jobs from the shared bounded ring; independent datagrams are
/// processed concurrently without sharing staging buffers.
pub struct PfWorker {
    thread: WorkerThread,
    env: PfEnv,
    plane: Arc<DataPlane>,
    ring: PfRing,
}

impl PfWorker {
    pub fn new(env: PfEnv, plane: Arc<DataPlane>, ring: PfRing) -> PfWorker {
        PfWorker {
            thread: WorkerThread::new("pf_worker"),
            env,
            plane,
            ring,
        }
    }
}

impl Worker for PfWorker {
    fn name(&self) -> &'static str {
        "pf_worker"
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

fn run(env: PfEnv, plane: Arc<DataPlane>, ring: PfRing, flag: Arc<AtomicBool>) {
    let mut chain = PfChain::standard();
    chain.configure(&env);

    logging::debug!(env.log, "pf worker running");

    while running(&flag) {
        let job = match ring.jobs_rx.recv_timeout(IO_POLL_INTERVAL) {
            Ok(job) => job,
            Err(_) => continue,
        };

        let buf = match job {
            PfJob::Egress { mut buf } => {
                let outcome = chain.run_tun(&env, &mut buf);
                complete_egress(&env, &plane, &buf, outcome);
                buf
            }
            PfJob::Ingress { mut buf, source } => {
                let outcome = chain.run_inet(&env, &mut buf, source);
                complete_ingress(&env, &plane, &buf, outcome);
                buf
            }
        };

        drop(ring.pool_tx.try_send(buf));
    }

    chain.release(&env);
}
