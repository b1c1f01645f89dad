use crate::net::payload::{sub, FramingError, PayloadBuf, PayloadType};
use crate::net::route::{ForwardClass, ROUTE_HEADER_SIZE};
use crate::pf::{FilterKind, PacketFilter, PfCtx, PfEnv, Verdict};
use byteorder::{BigEndian, ByteOrder};
use sett::logging;
use sett::time::timestamp_secs;
use std::sync::atomic::Ordering;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum CryptoMode {
    /// End-to-end payload encryption between the route endpoints.
    P2p,
    /// Hop-by-hop wrap so intermediaries authenticate without reading.
    Relay,
}

/// The crypto filter in one of its two variants. Each variant participates in
/// different phases; both draw keys from the per-peer schedule maintained by
/// the rekey walk.
pub struct CryptoFilter {
    mode: CryptoMode,
    scratch: Vec<u8>,
}

impl CryptoFilter {
    pub fn p2p() -> CryptoFilter {
        CryptoFilter {
            mode: CryptoMode::P2p,
            scratch: Vec::new(),
        }
    }

    pub fn relay() -> CryptoFilter {
        CryptoFilter {
            mode: CryptoMode::Relay,
            scratch: Vec::new(),
        }
    }

    /// Wraps the staged datagram for the next hop.
    fn wrap<'e>(&mut self, env: &'e PfEnv, ctx: &mut PfCtx<'e>, buf: &mut PayloadBuf) -> Verdict {
        let fwd_node = match ctx.fwd_node {
            Some(node) => node,
            None => return Verdict::Error,
        };

        let key = fwd_node.keys().key;

        match buf.wrap_outer(env.ctl.core.local_uuid, &key, &mut self.scratch) {
            Ok(()) => Verdict::Next,
            Err(err) => {
                logging::error!(env.log, "relay wrap failed"; "error" => ?err, "next" => fwd_node.uuid);
                Verdict::Error
            }
        }
    }
}

/// Additional data binding the payload segment to its envelope and route.
fn p2p_additional_data(payload_type: u8, sub_type: u8, src: u64, dst: u64) -> [u8; 18] {
    let mut additional_data = [0u8; 18];
    additional_data[0] = payload_type;
    additional_data[1] = sub_type;
    BigEndian::write_u64(&mut additional_data[2..], src);
    BigEndian::write_u64(&mut additional_data[10..], dst);
    additional_data
}

impl PacketFilter for CryptoFilter {
    fn name(&self) -> &'static str {
        match self.mode {
            CryptoMode::P2p => "crypto-p2p",
            CryptoMode::Relay => "crypto-relay",
        }
    }

    fn kind(&self) -> FilterKind {
        FilterKind::Crypto
    }

    /// Egress p2p encryption over the payload segment. Runs behind the route
    /// filter: the key depends on the resolved peer.
    fn tun_route<'e>(&mut self, env: &'e PfEnv, ctx: &mut PfCtx<'e>, buf: &mut PayloadBuf) -> Verdict {
        if self.mode != CryptoMode::P2p {
            return Verdict::Next;
        }

        let dst_node = match ctx.dst_node {
            Some(node) => node,
            None => return Verdict::Error,
        };

        let header = match ctx.route {
            Some(header) => header,
            None => return Verdict::Error,
        };

        buf.or_sub_type(sub::P2P);

        let additional_data = p2p_additional_data(buf.payload_type(), buf.sub_type(), header.src, header.dst);
        let key = dst_node.keys().key;

        match buf.encrypt_segment(ROUTE_HEADER_SIZE, &additional_data, &key, &mut self.scratch) {
            Ok(()) => Verdict::Next,
            Err(err) => {
                logging::error!(env.log, "payload encryption failed"; "error" => ?err, "dst" => dst_node.uuid);
                Verdict::Error
            }
        }
    }

    /// Egress relay wrap for relay-class routes. Appends the trailing relay
    /// ids first; they travel inside the wrap.
    fn tun_fwd<'e>(&mut self, env: &'e PfEnv, ctx: &mut PfCtx<'e>, buf: &mut PayloadBuf) -> Verdict {
        if self.mode != CryptoMode::Relay {
            return Verdict::Next;
        }

        if ctx.class != ForwardClass::Relay {
            return Verdict::Next;
        }

        if !ctx.relay.is_empty() {
            let body_len = buf.body_len();
            let ids_len = ctx.relay.wire_size();

            if ctx
                .relay
                .write(&mut buf.body_space_mut()[body_len..body_len + ids_len])
                .is_err()
            {
                return Verdict::Error;
            }

            if buf.set_body_len(body_len + ids_len).is_err() {
                return Verdict::Error;
            }
        }

        self.wrap(env, ctx, buf)
    }

    /// Ingress relay unwrap. Recovers the inner datagram and records the
    /// adjacent sender.
    fn inet_frame<'e>(&mut self, env: &'e PfEnv, ctx: &mut PfCtx<'e>, buf: &mut PayloadBuf) -> Verdict {
        if self.mode != CryptoMode::Relay {
            return Verdict::Next;
        }

        if buf.sub_type() & sub::RELAY == 0 {
            return Verdict::Next;
        }

        let status = &env.ctl.status;

        let from = match buf.outer_from() {
            Ok(from) => from,
            Err(_) => {
                status.framing_drop_frames.fetch_add(1, Ordering::Relaxed);
                return Verdict::Drop;
            }
        };

        let sender = match env.ctl.registry.by_uuid(from) {
            Some(node) => node,
            None => {
                logging::info!(env.log, "relay wrap from unknown node";
                               "from" => from,
                               "source" => ?ctx.source_addr);
                status.crypto_drop_frames.fetch_add(1, Ordering::Relaxed);
                return Verdict::Drop;
            }
        };

        let keys = sender.keys().decrypt_keys(timestamp_secs());

        match buf.unwrap_outer(&keys, &mut self.scratch) {
            Ok((payload_type, _)) => {
                if payload_type != u8::from(PayloadType::IpFrame) {
                    status.framing_drop_frames.fetch_add(1, Ordering::Relaxed);
                    return Verdict::Drop;
                }

                ctx.src_fwd_uuid = Some(from);
                Verdict::Next
            }
            Err(FramingError::Crypto) => {
                logging::info!(env.log, "relay wrap authentication failed";
                               "from" => from,
                               "source" => ?ctx.source_addr);
                status.crypto_drop_frames.fetch_add(1, Ordering::Relaxed);
                Verdict::Drop
            }
            Err(_) => {
                status.framing_drop_frames.fetch_add(1, Ordering::Relaxed);
                Verdict::Drop
            }
        }
    }

    /// Ingress p2p decryption for terminal frames.
    fn inet_route<'e>(&mut self, env: &'e PfEnv, ctx: &mut PfCtx<'e>, buf: &mut PayloadBuf) -> Verdict {
        if self.mode != CryptoMode::P2p {
            return Verdict::Next;
        }

        if !ctx.terminal {
            return Verdict::Next;
        }

        let status = &env.ctl.status;

        if buf.sub_type() & sub::P2P == 0 {
            logging::info!(env.log, "terminal frame without p2p layer"; "source" => ?ctx.source_addr);
            status.crypto_drop_frames.fetch_add(1, Ordering::Relaxed);
            return Verdict::Drop;
        }

        let src_node = match ctx.src_node {
            Some(node) => node,
            None => {
                logging::info!(env.log, "terminal frame from unknown source"; "source" => ?ctx.source_addr);
                status.crypto_drop_frames.fetch_add(1, Ordering::Relaxed);
                return Verdict::Drop;
            }
        };

        let header = match ctx.route {
            Some(header) => header,
            None => return Verdict::Error,
        };

        let additional_data = p2p_additional_data(buf.payload_type(), buf.sub_type(), header.src, header.dst);
        let keys = src_node.keys().decrypt_keys(timestamp_secs());

        match buf.decrypt_segment(ROUTE_HEADER_SIZE, &additional_data, &keys, &mut self.scratch) {
            Ok(()) => {
                buf.clear_sub_type(sub::P2P);
                Verdict::Next
            }
            Err(FramingError::Crypto) => {
                logging::info!(env.log, "payload authentication failed";
                               "src" => header.src,
                               "source" => ?ctx.source_addr);
                status.crypto_drop_frames.fetch_add(1, Ordering::Relaxed);
                Verdict::Drop
            }
            Err(_) => {
                status.framing_drop_frames.fetch_add(1, Ordering::Relaxed);
                Verdict::Drop
            }
        }
    }

    /// Transit re-wrap towards the rewritten next hop.
    fn inet_fwd<'e>(&mut self, env: &'e PfEnv, ctx: &mut PfCtx<'e>, buf: &mut PayloadBuf) -> Verdict {
        if self.mode != CryptoMode::Relay {
            return Verdict::Next;
        }

        self.wrap(env, ctx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::{Conf, NodeConf};
    use crate::ctl::CtlBlock;
    use crate::net::route::RouteHeader;
    use crate::registry::Registry;
    use sett::encoding::base64;
    use sett::keys::Identity;
    use std::sync::Arc;

    /// Two complete environments sharing one node table, as peers 100 and 200.
    fn paired_envs() -> (PfEnv, PfEnv) {
        let identity_a = Identity::generate().unwrap();
        let identity_b = Identity::generate().unwrap();

        let nodes = vec![
            NodeConf {
                uuid: 100,
                tun_addr4: "10.1.0.1".to_string(),
                public_key: base64::encode(identity_a.public()),
                ..NodeConf::default()
            },
            NodeConf {
                uuid: 200,
                tun_addr4: "10.1.0.2".to_string(),
                public_key: base64::encode(identity_b.public()),
                ..NodeConf::default()
            },
        ];

        let mut conf_a = Conf::default();
        conf_a.local_uuid = 100;
        conf_a.nodes = nodes.clone();

        let mut conf_b = Conf::default();
        conf_b.local_uuid = 200;
        conf_b.nodes = nodes;

        let conf_a = Arc::new(conf_a);
        let conf_b = Arc::new(conf_b);

        let registry_a = Arc::new(Registry::build(&conf_a, &identity_a).unwrap());
        let registry_b = Arc::new(Registry::build(&conf_b, &identity_b).unwrap());

        let env_a = PfEnv {
            conf: conf_a.clone(),
            ctl: Arc::new(CtlBlock::new(conf_a, identity_a, registry_a)),
            log: logging::null_logger(),
        };
        let env_b = PfEnv {
            conf: conf_b.clone(),
            ctl: Arc::new(CtlBlock::new(conf_b, identity_b, registry_b)),
            log: logging::null_logger(),
        };

        (env_a, env_b)
    }

    fn staged_routed_frame(src: u64, dst: u64, frame: &[u8]) -> PayloadBuf {
        let mut buf = PayloadBuf::new(4096);
        buf.set_header(PayloadType::IpFrame, 0);

        let header = RouteHeader {
            src,
            dst,
            ttl: 1,
            class: ForwardClass::Direct,
        };
        header.write(&mut buf.body_space_mut()[..ROUTE_HEADER_SIZE]).unwrap();

        buf.body_space_mut()[ROUTE_HEADER_SIZE..ROUTE_HEADER_SIZE + frame.len()].copy_from_slice(frame);
        buf.set_body_len(ROUTE_HEADER_SIZE + frame.len()).unwrap();
        buf
    }

    fn encrypt_at_a(env_a: &PfEnv, buf: &mut PayloadBuf) {
        let mut filter = CryptoFilter::p2p();
        let mut ctx = PfCtx::new();
        ctx.dst_node = env_a.ctl.registry.by_uuid(200);
        ctx.route = Some(RouteHeader {
            src: 100,
            dst: 200,
            ttl: 1,
            class: ForwardClass::Direct,
        });

        assert_eq!(filter.tun_route(env_a, &mut ctx, buf), Verdict::Next);
    }

    fn decrypt_at_b(env_b: &PfEnv, buf: &mut PayloadBuf) -> Verdict {
        let mut filter = CryptoFilter::p2p();
        let mut ctx = PfCtx::new();
        ctx.terminal = true;
        ctx.src_node = env_b.ctl.registry.by_uuid(100);
        ctx.route = Some(RouteHeader {
            src: 100,
            dst: 200,
            ttl: 1,
            class: ForwardClass::Direct,
        });

        filter.inet_route(env_b, &mut ctx, buf)
    }

    #[test]
    fn test_p2p_encrypt_then_decrypt_is_identity() {
        let (env_a, env_b) = paired_envs();

        let frame = [0x45u8; 120];
        let mut buf = staged_routed_frame(100, 200, &frame);

        encrypt_at_a(&env_a, &mut buf);
        assert_ne!(buf.sub_type() & sub::P2P, 0);
        assert_ne!(&buf.body()[ROUTE_HEADER_SIZE..ROUTE_HEADER_SIZE + 16], &frame[..16]);

        assert_eq!(decrypt_at_b(&env_b, &mut buf), Verdict::Next);
        assert_eq!(buf.sub_type() & sub::P2P, 0);
        assert_eq!(&buf.body()[ROUTE_HEADER_SIZE..], &frame[..]);
    }

    #[test]
    fn test_p2p_decrypt_under_other_key_drops() {
        let (env_a, env_b) = paired_envs();

        let mut buf = staged_routed_frame(100, 200, &[0x45u8; 120]);
        encrypt_at_a(&env_a, &mut buf);

        // Corrupt one cipher byte.
        let body_len = buf.body_len();
        buf.body_mut()[body_len - 1] ^= 1;

        assert_eq!(decrypt_at_b(&env_b, &mut buf), Verdict::Drop);
        assert_eq!(env_b.ctl.status.crypto_drop_frames.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_p2p_previous_key_applies_within_grace() {
        let (env_a, env_b) = paired_envs();

        let frame = [0x45u8; 120];
        let mut buf = staged_routed_frame(100, 200, &frame);

        // A encrypts under the old seed.
        encrypt_at_a(&env_a, &mut buf);

        // B rotates into the next window before the packet arrives.
        let now = sett::time::timestamp_secs() + env_b.conf.crypto_seed_window_sec;
        assert!(env_b.ctl.rekey(now, false, &logging::null_logger()));

        assert_eq!(decrypt_at_b(&env_b, &mut buf), Verdict::Next);
        assert_eq!(&buf.body()[ROUTE_HEADER_SIZE..], &frame[..]);
    }

    #[test]
    fn test_terminal_frame_without_p2p_layer_drops() {
        let (_, env_b) = paired_envs();

        let mut buf = staged_routed_frame(100, 200, &[0x45u8; 60]);

        assert_eq!(decrypt_at_b(&env_b, &mut buf), Verdict::Drop);
    }

    #[test]
    fn test_relay_wrap_unwrap_between_peers() {
        let (env_a, env_b) = paired_envs();

        let frame = [0x45u8; 80];
        let mut buf = staged_routed_frame(100, 200, &frame);
        let inner = buf.wire().to_vec();

        // A wraps towards B.
        let mut relay_a = CryptoFilter::relay();
        let mut ctx = PfCtx::new();
        ctx.fwd_node = env_a.ctl.registry.by_uuid(200);
        assert_eq!(relay_a.inet_fwd(&env_a, &mut ctx, &mut buf), Verdict::Next);
        assert_ne!(buf.sub_type() & sub::RELAY, 0);

        // B unwraps.
        let mut relay_b = CryptoFilter::relay();
        let mut ctx = PfCtx::new();
        assert_eq!(relay_b.inet_frame(&env_b, &mut ctx, &mut buf), Verdict::Next);
        assert_eq!(ctx.src_fwd_uuid, Some(100));
        assert_eq!(buf.wire(), &inner[..]);
    }

    #[test]
    fn test_relay_unwrap_from_unknown_node_drops() {
        let (env_a, env_b) = paired_envs();

        let mut buf = staged_routed_frame(100, 200, &[0x45u8; 80]);

        let mut relay_a = CryptoFilter::relay();
        let mut ctx = PfCtx::new();
        ctx.fwd_node = env_a.ctl.registry.by_uuid(200);
        assert_eq!(relay_a.inet_fwd(&env_a, &mut ctx, &mut buf), Verdict::Next);

        // Forge the sender uuid; B has no node 999 and must drop.
        let mut wire = buf.wire().to_vec();
        BigEndian::write_u64(&mut wire[4..], 999);

        let mut forged = PayloadBuf::new(4096);
        forged.install(&wire).unwrap();

        let mut relay_b = CryptoFilter::relay();
        let mut ctx = PfCtx::new();
        assert_eq!(relay_b.inet_frame(&env_b, &mut ctx, &mut forged), Verdict::Drop);
    }

    #[test]
    fn test_pass_through_on_foreign_phases() {
        let (env_a, _) = paired_envs();

        let mut buf = staged_routed_frame(100, 200, &[0x45u8; 80]);
        let before = buf.wire().to_vec();

        let mut p2p = CryptoFilter::p2p();
        let mut ctx = PfCtx::new();
        assert_eq!(p2p.tun_fwd(&env_a, &mut ctx, &mut buf), Verdict::Next);
        assert_eq!(p2p.inet_frame(&env_a, &mut ctx, &mut buf), Verdict::Next);

        let mut relay = CryptoFilter::relay();
        assert_eq!(relay.tun_route(&env_a, &mut ctx, &mut buf), Verdict::Next);
        assert_eq!(relay.inet_route(&env_a, &mut ctx, &mut buf), Verdict::Next);

        assert_eq!(buf.wire(), &before[..]);
    }
}
