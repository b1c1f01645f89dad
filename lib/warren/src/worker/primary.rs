use crate::ctl::CtlBlock;
use crate::error::CoreError;
use crate::worker::{running, Worker, WorkerThread, IO_POLL_INTERVAL};
use sett::logging::{self, Logger};
use sett::time::timestamp_secs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(10);

/// The supervisor: a one-second housekeeping ticker driving the keep-alive
/// stamp, the key-rotation walk and the diagnostics snapshot. Each duty has
/// its own period; nothing hangs off wall-clock modulo arithmetic.
pub struct PrimaryWorker {
    thread: WorkerThread,
    ctl: Arc<CtlBlock>,
    log: Logger,
}

impl PrimaryWorker {
    pub fn new(ctl: Arc<CtlBlock>, log: Logger) -> PrimaryWorker {
        PrimaryWorker {
            thread: WorkerThread::new("primary_worker"),
            ctl,
            log,
        }
    }
}

impl Worker for PrimaryWorker {
    fn name(&self) -> &'static str {
        "primary_worker"
    }

    fn start(&mut self) -> Result<(), CoreError> {
        let ctl = self.ctl.clone();
        let log = self.log.clone();

        self.thread.spawn(move |flag| run(ctl, log, flag))
    }

    fn stop(&mut self) {
        self.thread.stop();
    }
}

fn run(ctl: Arc<CtlBlock>, log: Logger, flag: Arc<AtomicBool>) {
    let mut last_tick = Instant::now();
    let mut last_snapshot = Instant::now();

    logging::debug!(log, "primary worker running");

    while running(&flag) {
        let now_sec = timestamp_secs();

        ctl.status.keep_alive_ts_sec.store(now_sec, Ordering::Relaxed);

        ctl.rekey(now_sec, false, &log);

        if !ctl.conf.map_file.is_empty() && last_snapshot.elapsed() >= SNAPSHOT_INTERVAL {
            last_snapshot = Instant::now();

            if let Err(err) = ctl.snapshot() {
                logging::error!(log, "snapshot failed"; "error" => %err);
            }
        }

        // Sleep out the remainder of the tick in short slices so stop()
        // returns promptly.
        while running(&flag) && last_tick.elapsed() < TICK_INTERVAL {
            std::thread::sleep(IO_POLL_INTERVAL.min(TICK_INTERVAL));
        }
        last_tick = Instant::now();
    }
}
