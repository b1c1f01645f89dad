use crate::net::payload::PayloadBuf;
use crate::net::route::{ForwardClass, RelayPath, RouteHeader, RELAY_ID_SIZE, ROUTE_HEADER_SIZE};
use crate::node::{Node, Reachability};
use crate::pf::{FilterKind, PacketFilter, PfAction, PfCtx, PfEnv, Verdict};
use sett::logging;
use sett::time::timestamp_secs;
use std::net::IpAddr;
use std::sync::atomic::Ordering;

/// Resolves forwarding targets: destination lookup and route-header
/// construction on egress, terminal/transit decisions and next-hop rewrite
/// on ingress.
pub struct RouteFilter;

impl RouteFilter {
    pub fn new() -> RouteFilter {
        RouteFilter
    }

    /// Owning node of a destination address: announced subnet gateways
    /// first, most specific prefix first, then the tun address index as
    /// fallback.
    fn resolve<'e>(env: &'e PfEnv, dst_ip: IpAddr) -> Option<&'e Node> {
        let registry = &env.ctl.registry;

        match dst_ip {
            IpAddr::V4(addr) => registry
                .by_subnet_c(addr)
                .or_else(|| registry.by_subnet_b(addr))
                .or_else(|| registry.by_subnet_a(addr))
                .or_else(|| registry.by_tun_ipv4(addr)),
            IpAddr::V6(addr) => registry.iter().find(|node| node.tun_addr6 == addr),
        }
    }

    /// First usable relay towards `dst`: configured preferences first, then
    /// any directly reachable peer.
    fn pick_relay<'e>(env: &'e PfEnv, dst: &Node, now_sec: u64) -> Option<&'e Node> {
        let registry = &env.ctl.registry;
        let local_uuid = env.ctl.core.local_uuid;
        let window = env.conf.liveness_window_sec;

        let usable = |node: &Node| {
            node.uuid != local_uuid
                && node.uuid != dst.uuid
                && node.reachability() == Reachability::Direct
                && node.pick_endpoint(now_sec, window).is_some()
        };

        for relay_uuid in &dst.relays {
            if let Some(node) = registry.by_uuid(*relay_uuid) {
                if usable(node) {
                    return Some(node);
                }
            }
        }

        registry.iter().find(|&node| usable(node))
    }
}

impl PacketFilter for RouteFilter {
    fn name(&self) -> &'static str {
        "route"
    }

    fn kind(&self) -> FilterKind {
        FilterKind::Route
    }

    /// Extracts the IP header view from the frame read off the tun device.
    fn tun_frame<'e>(&mut self, env: &'e PfEnv, ctx: &mut PfCtx<'e>, buf: &mut PayloadBuf) -> Verdict {
        let frame = &buf.body()[ROUTE_HEADER_SIZE.min(buf.body_len())..];

        if frame.is_empty() {
            env.ctl.status.framing_drop_frames.fetch_add(1, Ordering::Relaxed);
            return Verdict::Drop;
        }

        match frame[0] >> 4 {
            4 => {
                if frame.len() < 20 {
                    env.ctl.status.framing_drop_frames.fetch_add(1, Ordering::Relaxed);
                    return Verdict::Drop;
                }

                ctx.ip_version = 4;
                ctx.ip_proto = frame[9];
                ctx.dst_ip = Some(IpAddr::from([frame[16], frame[17], frame[18], frame[19]]));
            }
            6 => {
                if frame.len() < 40 {
                    env.ctl.status.framing_drop_frames.fetch_add(1, Ordering::Relaxed);
                    return Verdict::Drop;
                }

                let mut addr = [0u8; 16];
                addr.copy_from_slice(&frame[24..40]);

                ctx.ip_version = 6;
                ctx.ip_proto = frame[6];
                ctx.dst_ip = Some(IpAddr::from(addr));
            }
            version => {
                logging::trace!(env.log, "non-ip frame from tun"; "version" => version);
                env.ctl.status.framing_drop_frames.fetch_add(1, Ordering::Relaxed);
                return Verdict::Drop;
            }
        }

        ctx.src_node = Some(env.local());
        Verdict::Next
    }

    /// Destination lookup and route-header construction.
    fn tun_route<'e>(&mut self, env: &'e PfEnv, ctx: &mut PfCtx<'e>, buf: &mut PayloadBuf) -> Verdict {
        let dst_ip = match ctx.dst_ip {
            Some(addr) => addr,
            None => return Verdict::Error,
        };

        let local_uuid = env.ctl.core.local_uuid;
        let now_sec = timestamp_secs();
        let window = env.conf.liveness_window_sec;

        let dst_node = match Self::resolve(env, dst_ip) {
            Some(node) => node,
            None => {
                logging::debug!(env.log, "no route to destination"; "dst" => %dst_ip);
                return Verdict::NoRoute;
            }
        };

        if dst_node.uuid == local_uuid {
            return Verdict::Drop;
        }

        ctx.dst_node = Some(dst_node);

        // Direct path when the peer is reachable.
        if dst_node.reachability() == Reachability::Direct {
            if let Some(addr) = dst_node.pick_endpoint(now_sec, window) {
                let header = RouteHeader {
                    src: local_uuid,
                    dst: dst_node.uuid,
                    ttl: 1,
                    class: ForwardClass::Direct,
                };

                if header.write(&mut buf.body_mut()[..ROUTE_HEADER_SIZE]).is_err() {
                    return Verdict::Error;
                }

                ctx.route = Some(header);
                ctx.class = ForwardClass::Direct;
                ctx.fwd_node = Some(dst_node);
                ctx.action = PfAction::Emit(addr);
                return Verdict::Next;
            }
        }

        // Relay path otherwise.
        let relay_node = match Self::pick_relay(env, dst_node, now_sec) {
            Some(node) => node,
            None => {
                logging::debug!(env.log, "no relay towards destination";
                                "dst" => %dst_ip,
                                "dst_node" => dst_node.uuid);
                return Verdict::NoRoute;
            }
        };

        // The address the relay was picked by is known to exist.
        let relay_addr = match relay_node.pick_endpoint(now_sec, window) {
            Some(addr) => addr,
            None => return Verdict::NoRoute,
        };

        let mut path = RelayPath::new();
        if path.push(dst_node.uuid).is_err() {
            return Verdict::Error;
        }

        let header = RouteHeader {
            src: local_uuid,
            dst: dst_node.uuid,
            ttl: 1 + path.len() as u8,
            class: ForwardClass::Relay,
        };

        if header.write(&mut buf.body_mut()[..ROUTE_HEADER_SIZE]).is_err() {
            return Verdict::Error;
        }

        ctx.route = Some(header);
        ctx.relay = path;
        ctx.class = ForwardClass::Relay;
        ctx.fwd_node = Some(relay_node);
        ctx.action = PfAction::Emit(relay_addr);
        Verdict::Next
    }

    /// Parses the route header of a received frame.
    fn inet_frame<'e>(&mut self, env: &'e PfEnv, ctx: &mut PfCtx<'e>, buf: &mut PayloadBuf) -> Verdict {
        let header = match RouteHeader::read(buf.body()) {
            Ok(header) => header,
            Err(_) => {
                env.ctl.status.framing_drop_frames.fetch_add(1, Ordering::Relaxed);
                return Verdict::Drop;
            }
        };

        ctx.in_ttl = header.ttl;
        ctx.class = header.class;
        ctx.src_node = env.ctl.registry.by_uuid(header.src);
        ctx.dst_node = env.ctl.registry.by_uuid(header.dst);
        ctx.route = Some(header);

        Verdict::Next
    }

    /// Terminal or transit. Terminal packets continue into decryption;
    /// transit packets finish this phase and take the forward chain.
    fn inet_route<'e>(&mut self, env: &'e PfEnv, ctx: &mut PfCtx<'e>, _buf: &mut PayloadBuf) -> Verdict {
        let header = match ctx.route.as_mut() {
            Some(header) => header,
            None => return Verdict::Error,
        };

        if header.dst == env.ctl.core.local_uuid {
            ctx.terminal = true;
            return Verdict::Next;
        }

        if header.class != ForwardClass::Relay {
            logging::debug!(env.log, "transit frame without relay class"; "dst" => header.dst);
            return Verdict::Drop;
        }

        if header.ttl <= 1 {
            logging::debug!(env.log, "ttl exhausted"; "src" => header.src, "dst" => header.dst);
            env.ctl.status.ttl_drop_frames.fetch_add(1, Ordering::Relaxed);
            return Verdict::Drop;
        }

        header.ttl -= 1;
        Verdict::Finish
    }

    /// Rewrites the next hop of a transit frame: pops one relay id off the
    /// trailing array, or falls back to the destination itself.
    fn inet_fwd<'e>(&mut self, env: &'e PfEnv, ctx: &mut PfCtx<'e>, buf: &mut PayloadBuf) -> Verdict {
        let header = match ctx.route {
            Some(header) => header,
            None => return Verdict::Error,
        };

        let id_count = usize::from(ctx.in_ttl.saturating_sub(1));
        let ids_len = id_count * RELAY_ID_SIZE;
        let body_len = buf.body_len();

        if body_len < ROUTE_HEADER_SIZE + ids_len {
            env.ctl.status.framing_drop_frames.fetch_add(1, Ordering::Relaxed);
            return Verdict::Drop;
        }

        let tail_start = body_len - ids_len;

        let mut path = match RelayPath::read(&buf.body()[tail_start..], id_count) {
            Ok(path) => path,
            Err(_) => {
                env.ctl.status.framing_drop_frames.fetch_add(1, Ordering::Relaxed);
                return Verdict::Drop;
            }
        };

        let next_uuid = path.pop_front().unwrap_or(header.dst);

        let now_sec = timestamp_secs();
        let window = env.conf.liveness_window_sec;

        let fwd_node = match env.ctl.registry.by_uuid(next_uuid) {
            Some(node) => node,
            None => {
                logging::debug!(env.log, "unknown next hop"; "next" => next_uuid);
                return Verdict::NoRoute;
            }
        };

        let addr = match fwd_node.pick_endpoint(now_sec, window) {
            Some(addr) => addr,
            None => {
                logging::debug!(env.log, "next hop has no endpoint"; "next" => next_uuid);
                return Verdict::NoRoute;
            }
        };

        if header.write(&mut buf.body_mut()[..ROUTE_HEADER_SIZE]).is_err() {
            return Verdict::Error;
        }

        if path.write(&mut buf.body_mut()[tail_start..]).is_err() {
            return Verdict::Error;
        }

        if buf.set_body_len(tail_start + path.wire_size()).is_err() {
            return Verdict::Error;
        }

        ctx.fwd_node = Some(fwd_node);
        ctx.action = PfAction::Emit(addr);
        env.ctl.status.relay_tx_frames.fetch_add(1, Ordering::Relaxed);

        Verdict::Next
    }
}
