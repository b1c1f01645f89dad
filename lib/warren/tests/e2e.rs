//! End-to-end scenarios over real loopback UDP sockets and in-memory tun
//! devices: direct path, relay hop, TTL exhaustion, unknown destinations,
//! rekey continuity, framing robustness and shutdown.

use sett::encoding::base64;
use sett::keys::Identity;
use sett::logging;
use sett::time::timestamp_secs;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use warren::conf::{Conf, NodeConf};
use warren::core::Core;
use warren::net::payload::{PayloadBuf, PayloadType};
use warren::net::route::{ForwardClass, RouteHeader, ROUTE_HEADER_SIZE};
use warren::tun::{MemTun, TunDevice};

const HARVEST_TIMEOUT: Duration = Duration::from_secs(3);

struct Peer {
    core: Core,
    tun: Arc<MemTun>,
    addr: SocketAddr,
}

impl Peer {
    fn counters(&self) -> &warren::ctl::StatusZone {
        &self.core.ctl().status
    }
}

fn node_conf(uuid: u64, identity: &Identity, tun_addr4: &str) -> NodeConf {
    NodeConf {
        uuid,
        tun_addr4: tun_addr4.to_string(),
        public_key: base64::encode(identity.public()),
        ..NodeConf::default()
    }
}

fn spawn_peer(local_uuid: u64, nodes: Vec<NodeConf>, identity: Identity, pf_workers: usize) -> Peer {
    let mut conf = Conf::default();
    conf.local_uuid = local_uuid;
    conf.nodes = nodes;
    conf.udp4_ports = vec![0];
    conf.pf_worker_num = pf_workers;
    conf.quiet = true;

    let tun = Arc::new(MemTun::new());
    let mut core = Core::create(conf, identity, tun.clone()).unwrap();
    core.start().unwrap();

    let addr = core.local_udp4_addr().unwrap();

    Peer { core, tun, addr }
}

/// A minimal IPv4 frame: 20-byte header plus payload, protocol ICMP.
fn ipv4_frame(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();

    let mut frame = vec![0u8; total];
    frame[0] = 0x45;
    frame[2] = (total >> 8) as u8;
    frame[3] = total as u8;
    frame[8] = 64;
    frame[9] = 1;
    frame[12..16].copy_from_slice(&src);
    frame[16..20].copy_from_slice(&dst);
    frame[20..].copy_from_slice(payload);

    frame
}

fn wait_for_counter(counter: &AtomicU64, minimum: u64) -> bool {
    let deadline = Instant::now() + HARVEST_TIMEOUT;

    while Instant::now() < deadline {
        if counter.load(Ordering::Relaxed) >= minimum {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    false
}

#[test]
fn test_two_node_direct_path() {
    let identity_a = Identity::generate().unwrap();
    let identity_b = Identity::generate().unwrap();

    let nodes = vec![
        node_conf(100, &identity_a, "10.1.0.1"),
        node_conf(200, &identity_b, "10.1.0.2"),
    ];

    let mut peer_a = spawn_peer(100, nodes.clone(), identity_a, 0);
    let mut peer_b = spawn_peer(200, nodes, identity_b, 0);

    let now = timestamp_secs();
    peer_a.core.ctl().registry.record_observation(200, peer_b.addr, now);
    peer_b.core.ctl().registry.record_observation(100, peer_a.addr, now);

    // A -> B
    let request = ipv4_frame([10, 1, 0, 1], [10, 1, 0, 2], b"echo request");
    peer_a.tun.inject(&request);

    assert_eq!(peer_b.tun.harvest(HARVEST_TIMEOUT).unwrap(), request);
    assert!(peer_a.counters().tun_rx_frames.load(Ordering::Relaxed) >= 1);
    assert!(wait_for_counter(&peer_b.counters().tun_tx_frames, 1));

    // B -> A mirrors it.
    let reply = ipv4_frame([10, 1, 0, 2], [10, 1, 0, 1], b"echo reply");
    peer_b.tun.inject(&reply);

    assert_eq!(peer_a.tun.harvest(HARVEST_TIMEOUT).unwrap(), reply);

    peer_a.core.stop();
    peer_b.core.stop();
}

#[test]
fn test_relay_hop_forwarding() {
    let identity_a = Identity::generate().unwrap();
    let identity_r = Identity::generate().unwrap();
    let identity_b = Identity::generate().unwrap();

    let mut node_a = node_conf(100, &identity_a, "10.1.0.1");
    let node_r = node_conf(300, &identity_r, "10.1.0.3");
    let mut node_b = node_conf(200, &identity_b, "10.1.0.2");

    // A and B cannot reach each other directly and both prefer relay 300.
    node_a.relays = vec![300];
    node_b.relays = vec![300];

    let nodes = vec![node_a, node_r, node_b];

    let mut peer_r = spawn_peer(300, nodes.clone(), identity_r, 0);
    let mut peer_a = spawn_peer(100, nodes.clone(), identity_a, 0);
    let mut peer_b = spawn_peer(200, nodes, identity_b, 0);

    let now = timestamp_secs();
    peer_a.core.ctl().registry.record_observation(300, peer_r.addr, now);
    peer_b.core.ctl().registry.record_observation(300, peer_r.addr, now);
    peer_r.core.ctl().registry.record_observation(100, peer_a.addr, now);
    peer_r.core.ctl().registry.record_observation(200, peer_b.addr, now);

    // A -> B through R.
    let request = ipv4_frame([10, 1, 0, 1], [10, 1, 0, 2], b"relayed request");
    peer_a.tun.inject(&request);

    assert_eq!(peer_b.tun.harvest(HARVEST_TIMEOUT).unwrap(), request);
    assert!(peer_r.counters().relay_tx_frames.load(Ordering::Relaxed) >= 1);

    // Nothing was delivered to the relay's own interface.
    assert_eq!(peer_r.counters().tun_tx_frames.load(Ordering::Relaxed), 0);

    // Reverse path is symmetric.
    let reply = ipv4_frame([10, 1, 0, 2], [10, 1, 0, 1], b"relayed reply");
    peer_b.tun.inject(&reply);

    assert_eq!(peer_a.tun.harvest(HARVEST_TIMEOUT).unwrap(), reply);

    peer_a.core.stop();
    peer_b.core.stop();
    peer_r.core.stop();
}

#[test]
fn test_ttl_exhaustion_drops_at_relay() {
    let identity_a = Identity::generate().unwrap();
    let identity_r = Identity::generate().unwrap();
    let identity_b = Identity::generate().unwrap();

    let nodes = vec![
        node_conf(100, &identity_a, "10.1.0.1"),
        node_conf(300, &identity_r, "10.1.0.3"),
        node_conf(200, &identity_b, "10.1.0.2"),
    ];

    // Only the relay runs as a real peer; the packet is hand-crafted from
    // A's key material.
    let key_ar = {
        let mut conf = Conf::default();
        conf.local_uuid = 100;
        conf.nodes = nodes.clone();
        let registry = warren::registry::Registry::build(&conf, &identity_a).unwrap();
        let ctl = warren::ctl::CtlBlock::new(Arc::new(conf), identity_a, Arc::new(registry));
        ctl.registry.by_uuid(300).unwrap().keys().key
    };

    let mut peer_r = spawn_peer(300, nodes, identity_r, 0);

    // Relay-class frame that arrives with TTL=1.
    let mut buf = PayloadBuf::new(4096);
    buf.set_header(PayloadType::IpFrame, 0);

    let header = RouteHeader {
        src: 100,
        dst: 200,
        ttl: 1,
        class: ForwardClass::Relay,
    };
    header.write(&mut buf.body_space_mut()[..ROUTE_HEADER_SIZE]).unwrap();

    let frame = ipv4_frame([10, 1, 0, 1], [10, 1, 0, 2], b"should die here");
    buf.body_space_mut()[ROUTE_HEADER_SIZE..ROUTE_HEADER_SIZE + frame.len()].copy_from_slice(&frame);
    buf.set_body_len(ROUTE_HEADER_SIZE + frame.len()).unwrap();

    let mut scratch = Vec::new();
    buf.wrap_outer(100, &key_ar, &mut scratch).unwrap();

    let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
    probe.send_to(buf.wire(), peer_r.addr).unwrap();

    assert!(wait_for_counter(&peer_r.counters().ttl_drop_frames, 1));

    // No egress: the relay forwarded nothing.
    assert_eq!(peer_r.counters().relay_tx_frames.load(Ordering::Relaxed), 0);

    peer_r.core.stop();
}

#[test]
fn test_unknown_destination_is_noroute() {
    let identity_a = Identity::generate().unwrap();
    let identity_b = Identity::generate().unwrap();

    let nodes = vec![
        node_conf(100, &identity_a, "10.1.0.1"),
        node_conf(200, &identity_b, "10.1.0.2"),
    ];

    let mut peer_a = spawn_peer(100, nodes, identity_a, 0);

    let orphan = ipv4_frame([10, 1, 0, 1], [10, 1, 99, 99], b"nowhere");
    peer_a.tun.inject(&orphan);

    assert!(wait_for_counter(&peer_a.counters().noroute_frames, 1));
    assert_eq!(peer_a.counters().inet_tx_frames.load(Ordering::Relaxed), 0);

    peer_a.core.stop();
}

#[test]
fn test_rekey_continuity() {
    let identity_a = Identity::generate().unwrap();
    let identity_b = Identity::generate().unwrap();

    let nodes = vec![
        node_conf(100, &identity_a, "10.1.0.1"),
        node_conf(200, &identity_b, "10.1.0.2"),
    ];

    let mut peer_a = spawn_peer(100, nodes.clone(), identity_a, 0);
    let mut peer_b = spawn_peer(200, nodes, identity_b, 0);

    let now = timestamp_secs();
    peer_a.core.ctl().registry.record_observation(200, peer_b.addr, now);
    peer_b.core.ctl().registry.record_observation(100, peer_a.addr, now);

    // Sustained traffic across a forced seed advance on both sides.
    let window = peer_a.core.conf().crypto_seed_window_sec;
    let log = logging::null_logger();

    for i in 0..3u8 {
        let frame = ipv4_frame([10, 1, 0, 1], [10, 1, 0, 2], &[i; 24]);
        peer_a.tun.inject(&frame);
        assert_eq!(peer_b.tun.harvest(HARVEST_TIMEOUT).unwrap(), frame);
    }

    assert!(peer_a.core.ctl().rekey(now + window, true, &log));
    assert!(peer_b.core.ctl().rekey(now + window, true, &log));

    for i in 10..13u8 {
        let frame = ipv4_frame([10, 1, 0, 1], [10, 1, 0, 2], &[i; 24]);
        peer_a.tun.inject(&frame);
        assert_eq!(peer_b.tun.harvest(HARVEST_TIMEOUT).unwrap(), frame);
    }

    assert!(peer_a.counters().rekey_events.load(Ordering::Relaxed) >= 1);
    assert!(peer_b.counters().rekey_events.load(Ordering::Relaxed) >= 1);

    peer_a.core.stop();
    peer_b.core.stop();
}

#[test]
fn test_framing_robustness() {
    let identity_a = Identity::generate().unwrap();
    let nodes = vec![node_conf(100, &identity_a, "10.1.0.1")];

    let mut peer_a = spawn_peer(100, nodes, identity_a, 0);

    let probe = UdpSocket::bind("127.0.0.1:0").unwrap();

    // Size field larger than the datagram.
    probe.send_to(&[0xff, 0xff, 0x02, 0x00, 1, 2, 3], peer_a.addr).unwrap();
    assert!(wait_for_counter(&peer_a.counters().framing_drop_frames, 1));

    // Runt datagram.
    probe.send_to(&[0x00], peer_a.addr).unwrap();
    assert!(wait_for_counter(&peer_a.counters().framing_drop_frames, 2));

    // Unknown top-level type.
    probe.send_to(&[0x00, 0x01, 0x55, 0x00, 0xaa], peer_a.addr).unwrap();
    assert!(wait_for_counter(&peer_a.counters().framing_drop_frames, 3));

    // The engine is still alive and counting.
    assert!(peer_a.counters().inet_rx_frames.load(Ordering::Relaxed) >= 3);

    peer_a.core.stop();
}

#[test]
fn test_parallel_pf_workers() {
    let identity_a = Identity::generate().unwrap();
    let identity_b = Identity::generate().unwrap();

    let nodes = vec![
        node_conf(100, &identity_a, "10.1.0.1"),
        node_conf(200, &identity_b, "10.1.0.2"),
    ];

    let mut peer_a = spawn_peer(100, nodes.clone(), identity_a, 2);
    let mut peer_b = spawn_peer(200, nodes, identity_b, 2);

    let now = timestamp_secs();
    peer_a.core.ctl().registry.record_observation(200, peer_b.addr, now);
    peer_b.core.ctl().registry.record_observation(100, peer_a.addr, now);

    let frames: Vec<Vec<u8>> = (0..20u8)
        .map(|i| ipv4_frame([10, 1, 0, 1], [10, 1, 0, 2], &[i; 40]))
        .collect();

    for frame in &frames {
        peer_a.tun.inject(frame);
    }

    // Parallel workers may reorder between packets; collect and compare as a set.
    let mut received = Vec::new();
    for _ in 0..frames.len() {
        received.push(peer_b.tun.harvest(HARVEST_TIMEOUT).expect("frame lost"));
    }

    let mut expected = frames.clone();
    expected.sort();
    received.sort();
    assert_eq!(received, expected);

    peer_a.core.stop();
    peer_b.core.stop();
}

#[test]
fn test_stop_drains_workers_and_keeps_ctl() {
    let identity_a = Identity::generate().unwrap();
    let nodes = vec![node_conf(100, &identity_a, "10.1.0.1")];

    let mut peer_a = spawn_peer(100, nodes, identity_a, 1);

    assert!(wait_for_counter(&peer_a.counters().keep_alive_ts_sec, 1));
    assert!(peer_a.core.udp_open());

    peer_a.core.stop();

    // The control block survives for diagnostics.
    let stamp = peer_a.counters().keep_alive_ts_sec.load(Ordering::Relaxed);
    assert!(stamp > 0);

    // The device is closed: reads fail rather than block.
    let mut buf = [0u8; 32];
    assert!(peer_a.tun.read(&mut buf, Duration::from_millis(10)).is_err());

    // Every UDP socket is closed as well, and nothing receives anymore.
    assert!(!peer_a.core.udp_open());

    let rx_before = peer_a.counters().inet_rx_frames.load(Ordering::Relaxed);
    let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
    probe.send_to(&[0x00, 0x00, 0x06, 0x00], peer_a.addr).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(peer_a.counters().inet_rx_frames.load(Ordering::Relaxed), rx_before);

    // Stopping again is a no-op.
    peer_a.core.stop();
}
