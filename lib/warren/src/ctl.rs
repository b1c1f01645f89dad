use crate::conf::Conf;
use crate::error::CoreError;
use crate::node::{KeySchedule, Node};
use crate::registry::Registry;
use byteorder::{BigEndian, ByteOrder};
use serde_derive::{Deserialize, Serialize};
use sett::keys::Identity;
use sett::logging::{self, Logger};
use sett::{crypto, time};
use std::fs;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Core zone: identity material and interface naming, immutable once built.
pub struct CoreZone {
    pub identity: Identity,
    pub local_uuid: u64,
    pub ifname: String,
}

/// Status zone: keep-alive stamp and datapath counters. Written by exactly
/// one worker per field, read by anyone.
pub struct StatusZone {
    pub keep_alive_ts_sec: AtomicU64,

    pub tun_rx_frames: AtomicU64,
    pub tun_tx_frames: AtomicU64,
    pub inet_rx_frames: AtomicU64,
    pub inet_tx_frames: AtomicU64,
    pub relay_tx_frames: AtomicU64,
    pub ping_rx_frames: AtomicU64,

    pub drop_frames: AtomicU64,
    pub noroute_frames: AtomicU64,
    pub crypto_drop_frames: AtomicU64,
    pub ttl_drop_frames: AtomicU64,
    pub framing_drop_frames: AtomicU64,

    pub rekey_events: AtomicU64,
}

impl StatusZone {
    fn new() -> StatusZone {
        StatusZone {
            keep_alive_ts_sec: AtomicU64::new(0),
            tun_rx_frames: AtomicU64::new(0),
            tun_tx_frames: AtomicU64::new(0),
            inet_rx_frames: AtomicU64::new(0),
            inet_tx_frames: AtomicU64::new(0),
            relay_tx_frames: AtomicU64::new(0),
            ping_rx_frames: AtomicU64::new(0),
            drop_frames: AtomicU64::new(0),
            noroute_frames: AtomicU64::new(0),
            crypto_drop_frames: AtomicU64::new(0),
            ttl_drop_frames: AtomicU64::new(0),
            framing_drop_frames: AtomicU64::new(0),
            rekey_events: AtomicU64::new(0),
        }
    }
}

/// The rotating 32-bit seed mixed into symmetric key derivation.
pub struct TimeSeed {
    seed: AtomicU32,
    updated_at_sec: AtomicU64,
    window_sec: u64,
}

impl TimeSeed {
    pub fn new(window_sec: u64, now_sec: u64) -> TimeSeed {
        TimeSeed {
            seed: AtomicU32::new(time::seed_for(now_sec, window_sec)),
            updated_at_sec: AtomicU64::new(now_sec),
            window_sec,
        }
    }

    #[inline]
    pub fn current(&self) -> u32 {
        self.seed.load(Ordering::Acquire)
    }

    /// True when the wall clock has crossed into a new seed window.
    #[inline]
    pub fn needs_update(&self, now_sec: u64) -> bool {
        time::seed_for(now_sec, self.window_sec) != self.current()
    }

    /// Advances to the seed for `now_sec` and returns it.
    #[inline]
    pub fn advance(&self, now_sec: u64) -> u32 {
        let seed = time::seed_for(now_sec, self.window_sec);
        self.seed.store(seed, Ordering::Release);
        self.updated_at_sec.store(now_sec, Ordering::Release);
        seed
    }
}

/// The control block: one owned struct with explicit zones, the single source
/// of truth for peer state. Destroyed only after all workers have joined.
pub struct CtlBlock {
    pub conf: Arc<Conf>,
    pub core: CoreZone,
    pub status: StatusZone,
    pub seed: TimeSeed,
    pub registry: Arc<Registry>,
}

impl CtlBlock {
    /// Builds the block and derives the initial key schedule for every peer.
    pub fn new(conf: Arc<Conf>, identity: Identity, registry: Arc<Registry>) -> CtlBlock {
        let now_sec = time::timestamp_secs();

        let block = CtlBlock {
            core: CoreZone {
                identity,
                local_uuid: conf.local_uuid,
                ifname: conf.ifname.clone(),
            },
            seed: TimeSeed::new(conf.crypto_seed_window_sec, now_sec),
            status: StatusZone::new(),
            registry,
            conf,
        };

        let seed = block.seed.current();
        for node in block.registry.iter() {
            if node.uuid == block.core.local_uuid {
                continue;
            }
            let key = derive_node_key(node, block.core.local_uuid, seed);
            node.install_keys(KeySchedule::initial(seed, key, now_sec));
        }

        block
    }

    /// Rotates per-peer keys when the time seed advances (or unconditionally
    /// with `force`). The previous key is retained for the grace window so
    /// in-flight packets survive the rotation. Returns whether keys rotated.
    pub fn rekey(&self, now_sec: u64, force: bool, log: &Logger) -> bool {
        if self.registry.len() == 0 {
            return false;
        }

        if !force && !self.seed.needs_update(now_sec) {
            return false;
        }

        let seed = self.seed.advance(now_sec);

        for node in self.registry.iter() {
            if node.uuid == self.core.local_uuid {
                continue;
            }

            let old = node.keys();
            let key = derive_node_key(node, self.core.local_uuid, seed);
            node.install_keys(KeySchedule {
                seed,
                key,
                previous: Some((old.seed, old.key)),
                rotated_at_sec: now_sec,
            });
        }

        self.status.rekey_events.fetch_add(1, Ordering::Relaxed);
        logging::info!(log, "crypto key rotation"; "seed" => seed, "nodes" => self.registry.len());

        true
    }

    /// Writes the diagnostics snapshot to `map_file`, if one is configured.
    /// Temp-file plus rename so observers never see a torn image.
    pub fn snapshot(&self) -> Result<(), CoreError> {
        if self.conf.map_file.is_empty() {
            return Ok(());
        }

        let image = Snapshot::collect(self);
        let encoded = bincode::serialize(&image)
            .map_err(|err| CoreError::Resource(format!("snapshot encode: {}", err)))?;

        let tmp_path = format!("{}.tmp", self.conf.map_file);
        fs::write(&tmp_path, &encoded)?;
        fs::rename(&tmp_path, &self.conf.map_file)?;

        Ok(())
    }
}

/// Deterministic per-peer key: keyed hash of the canonically ordered uuid
/// pair and the time seed, keyed by the X25519 shared secret. Both sides of
/// a pair compute the same value for the same seed.
pub fn derive_node_key(node: &Node, local_uuid: u64, seed: u32) -> [u8; crypto::KEY_SIZE] {
    let lo = local_uuid.min(node.uuid);
    let hi = local_uuid.max(node.uuid);

    let mut material = [0u8; 20];
    BigEndian::write_u64(&mut material[0..], lo);
    BigEndian::write_u64(&mut material[8..], hi);
    BigEndian::write_u32(&mut material[16..], seed);

    crypto::derive_key(node.shared_secret(), &material)
}

/// Serialized control-block image for external inspection.
#[derive(Serialize, Deserialize)]
pub struct Snapshot {
    pub ts_sec: u64,
    pub seed: u32,
    pub keep_alive_ts_sec: u64,
    pub tun_rx_frames: u64,
    pub tun_tx_frames: u64,
    pub inet_rx_frames: u64,
    pub inet_tx_frames: u64,
    pub relay_tx_frames: u64,
    pub drop_frames: u64,
    pub noroute_frames: u64,
    pub nodes: Vec<NodeSnapshot>,
}

#[derive(Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub uuid: u64,
    pub reachability: u8,
    pub last_seen_sec: u64,
    pub endpoints: Vec<(String, u64)>,
}

impl Snapshot {
    fn collect(block: &CtlBlock) -> Snapshot {
        let status = &block.status;

        Snapshot {
            ts_sec: time::timestamp_secs(),
            seed: block.seed.current(),
            keep_alive_ts_sec: status.keep_alive_ts_sec.load(Ordering::Relaxed),
            tun_rx_frames: status.tun_rx_frames.load(Ordering::Relaxed),
            tun_tx_frames: status.tun_tx_frames.load(Ordering::Relaxed),
            inet_rx_frames: status.inet_rx_frames.load(Ordering::Relaxed),
            inet_tx_frames: status.inet_tx_frames.load(Ordering::Relaxed),
            relay_tx_frames: status.relay_tx_frames.load(Ordering::Relaxed),
            drop_frames: status.drop_frames.load(Ordering::Relaxed),
            noroute_frames: status.noroute_frames.load(Ordering::Relaxed),
            nodes: block
                .registry
                .iter()
                .map(|node| NodeSnapshot {
                    uuid: node.uuid,
                    reachability: node.reachability() as u8,
                    last_seen_sec: node.last_seen_sec(),
                    endpoints: node
                        .endpoints()
                        .iter()
                        .map(|e| (e.addr.to_string(), e.last_seen_sec))
                        .collect(),
                })
                .collect(),
        }
    }
}
