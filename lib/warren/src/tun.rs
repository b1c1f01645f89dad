use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunError {
    #[error("tun device busy")]
    Busy,

    #[error("tun device closed")]
    Closed,

    #[error("tun read timed out")]
    TimedOut,

    #[error("tun i/o error: {0}")]
    Io(String),
}

/// A virtual network interface presenting raw IP frames. Real OS drivers live
/// outside this crate; the engine only depends on this surface. `init` runs
/// once at engine construction, `open` when the datapath comes up; `read`
/// takes a timeout so `stop()` can unblock the tun worker.
pub trait TunDevice {
    fn init(&self) -> Result<(), TunError> {
        Ok(())
    }
    fn open(&self) -> Result<(), TunError>;
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TunError>;
    fn write(&self, frame: &[u8]) -> Result<usize, TunError>;
    fn close(&self);
}

/// In-memory loopback device. Frames injected by the application surface in
/// `read`; frames the engine delivers are collected via `harvest`. Used by the
/// test suites and selectable in configuration as `if_drv = "mem"`.
pub struct MemTun {
    ingress_tx: Sender<Vec<u8>>,
    ingress_rx: Receiver<Vec<u8>>,
    egress_tx: Sender<Vec<u8>>,
    egress_rx: Receiver<Vec<u8>>,
    open: AtomicBool,
}

impl MemTun {
    pub fn new() -> MemTun {
        let (ingress_tx, ingress_rx) = unbounded();
        let (egress_tx, egress_rx) = unbounded();

        MemTun {
            ingress_tx,
            ingress_rx,
            egress_tx,
            egress_rx,
            open: AtomicBool::new(false),
        }
    }

    /// Makes a frame available to the next `read`.
    pub fn inject(&self, frame: &[u8]) {
        drop(self.ingress_tx.send(frame.to_vec()));
    }

    /// Collects one frame the engine wrote to the device.
    pub fn harvest(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.egress_rx.recv_timeout(timeout).ok()
    }
}

impl TunDevice for MemTun {
    fn open(&self) -> Result<(), TunError> {
        match self.open.swap(true, Ordering::SeqCst) {
            false => Ok(()),
            true => Err(TunError::Busy),
        }
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TunError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TunError::Closed);
        }

        let frame = self.ingress_rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => TunError::TimedOut,
            RecvTimeoutError::Disconnected => TunError::Closed,
        })?;

        if frame.len() > buf.len() {
            return Err(TunError::Io(format!(
                "frame of {} bytes exceeds read buffer of {}",
                frame.len(),
                buf.len()
            )));
        }

        buf[..frame.len()].copy_from_slice(&frame);
        Ok(frame.len())
    }

    fn write(&self, frame: &[u8]) -> Result<usize, TunError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TunError::Closed);
        }

        self.egress_tx.send(frame.to_vec()).map_err(|_| TunError::Closed)?;
        Ok(frame.len())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
