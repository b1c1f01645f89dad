use arc_swap::ArcSwap;
use parking_lot::RwLock;
use sett::crypto;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Bound on remembered endpoints per peer.
pub const ENDPOINT_RING_SIZE: usize = 8;

/// After a key rotation the previous key stays valid for this long.
pub const KEY_GRACE_SEC: u64 = 30;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Reachability {
    Unknown = 0,
    Direct = 1,
    Relay = 2,
}

impl Reachability {
    #[inline]
    fn from_u8(value: u8) -> Reachability {
        match value {
            1 => Reachability::Direct,
            2 => Reachability::Relay,
            _ => Reachability::Unknown,
        }
    }
}

/// One observed endpoint of a peer.
#[derive(Debug, Copy, Clone)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub last_seen_sec: u64,
}

/// Per-peer symmetric key state. Replaced wholesale on rotation so readers
/// never observe a torn key.
pub struct KeySchedule {
    pub seed: u32,
    pub key: [u8; crypto::KEY_SIZE],
    pub previous: Option<(u32, [u8; crypto::KEY_SIZE])>,
    pub rotated_at_sec: u64,
}

impl KeySchedule {
    #[inline]
    pub fn initial(seed: u32, key: [u8; crypto::KEY_SIZE], now_sec: u64) -> KeySchedule {
        KeySchedule {
            seed,
            key,
            previous: None,
            rotated_at_sec: now_sec,
        }
    }

    /// Keys to try on decrypt: the current key, and the previous key while the
    /// rotation is within the grace window.
    pub fn decrypt_keys(&self, now_sec: u64) -> Vec<[u8; crypto::KEY_SIZE]> {
        let mut keys = vec![self.key];

        if let Some((_, previous)) = &self.previous {
            if now_sec.saturating_sub(self.rotated_at_sec) <= KEY_GRACE_SEC {
                keys.push(*previous);
            }
        }

        keys
    }
}

/// One peer of the overlay. Records live for the daemon's lifetime; the
/// mutable fields are updated in place under the ownership rules of their
/// writers (endpoints: node worker, keys: primary worker).
pub struct Node {
    pub uuid: u64,
    pub public_key: [u8; crypto::SIGN_PUBLIC_KEY_SIZE],
    pub tun_addr4: Ipv4Addr,
    pub tun_addr6: Ipv6Addr,
    pub relays: Vec<u64>,

    shared_secret: [u8; crypto::EXCHANGE_KEY_SIZE],

    endpoints: RwLock<Vec<Endpoint>>,
    cursor: AtomicUsize,
    last_seen_sec: AtomicU64,
    reachability: AtomicU8,
    keys: ArcSwap<KeySchedule>,
}

impl Node {
    pub fn new(
        uuid: u64,
        public_key: [u8; crypto::SIGN_PUBLIC_KEY_SIZE],
        tun_addr4: Ipv4Addr,
        tun_addr6: Ipv6Addr,
        relays: Vec<u64>,
        shared_secret: [u8; crypto::EXCHANGE_KEY_SIZE],
    ) -> Node {
        Node {
            uuid,
            public_key,
            tun_addr4,
            tun_addr6,
            relays,
            shared_secret,
            endpoints: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            last_seen_sec: AtomicU64::new(0),
            reachability: AtomicU8::new(Reachability::Unknown as u8),
            keys: ArcSwap::new(Arc::new(KeySchedule::initial(0, [0; crypto::KEY_SIZE], 0))),
        }
    }

    #[inline]
    pub(crate) fn shared_secret(&self) -> &[u8; crypto::EXCHANGE_KEY_SIZE] {
        &self.shared_secret
    }

    #[inline]
    pub fn reachability(&self) -> Reachability {
        Reachability::from_u8(self.reachability.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_reachability(&self, reachability: Reachability) {
        self.reachability.store(reachability as u8, Ordering::Relaxed);
    }

    #[inline]
    pub fn last_seen_sec(&self) -> u64 {
        self.last_seen_sec.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn touch(&self, now_sec: u64) {
        self.last_seen_sec.store(now_sec, Ordering::Relaxed);
    }

    /// Current key schedule.
    #[inline]
    pub fn keys(&self) -> Arc<KeySchedule> {
        self.keys.load_full()
    }

    /// Installs a new key schedule. Single writer: the primary worker.
    #[inline]
    pub fn install_keys(&self, schedule: KeySchedule) {
        self.keys.store(Arc::new(schedule));
    }

    /// Records an observed endpoint. Single writer: the node worker. A known
    /// address refreshes its timestamp, a new one displaces the stalest entry
    /// once the ring is full.
    pub fn record_endpoint(&self, addr: SocketAddr, now_sec: u64) {
        let mut ring = self.endpoints.write();

        if let Some(entry) = ring.iter_mut().find(|e| e.addr == addr) {
            entry.last_seen_sec = now_sec;
        } else if ring.len() < ENDPOINT_RING_SIZE {
            ring.push(Endpoint {
                addr,
                last_seen_sec: now_sec,
            });
        } else {
            let stalest = ring
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.last_seen_sec)
                .map(|(i, _)| i)
                .unwrap_or(0);
            ring[stalest] = Endpoint {
                addr,
                last_seen_sec: now_sec,
            };
        }

        drop(ring);

        self.touch(now_sec);
        self.set_reachability(Reachability::Direct);
    }

    /// Picks an endpoint for transmission. The per-peer cursor walks the ring
    /// to spread load; endpoints seen alive within the liveness window are
    /// preferred, otherwise the cursor position is used as-is.
    pub fn pick_endpoint(&self, now_sec: u64, liveness_window_sec: u64) -> Option<SocketAddr> {
        let ring = self.endpoints.read();

        if ring.is_empty() {
            return None;
        }

        let base = self.cursor.fetch_add(1, Ordering::Relaxed);

        for i in 0..ring.len() {
            let entry = &ring[(base + i) % ring.len()];
            if now_sec.saturating_sub(entry.last_seen_sec) <= liveness_window_sec {
                return Some(entry.addr);
            }
        }

        Some(ring[base % ring.len()].addr)
    }

    /// Copy of the current endpoint ring.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.read().clone()
    }
}
