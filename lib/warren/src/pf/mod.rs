//! The packet-filter chain: a filter is a value with up to six chain entry
//! points; the dispatcher holds phase-ordered collections and drives a
//! complete tun or inet cycle per packet, acting on verdicts.

pub mod crypto;
pub mod dump;
pub mod route;
pub mod zip;

use crate::conf::Conf;
use crate::ctl::CtlBlock;
use crate::error::CoreError;
use crate::net::payload::PayloadBuf;
use crate::net::route::{ForwardClass, RelayPath, RouteHeader};
use crate::node::Node;
use sett::logging::{self, Logger};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Verdict {
    /// Continue with the next filter in this phase.
    Next,
    /// Phase completed; skip the remaining filters in it.
    Finish,
    /// Discard the packet silently.
    Drop,
    /// No forwarding target found.
    NoRoute,
    /// Unrecoverable processing error.
    Error,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FilterKind {
    Dump,
    Route,
    Crypto,
    Compress,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Phase {
    TunFrame = 0,
    TunRoute = 1,
    TunFwd = 2,
    InetFrame = 3,
    InetRoute = 4,
    InetFwd = 5,
}

const PHASE_COUNT: usize = 6;

/// What the drivers should do with the packet once the chains complete.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PfAction {
    None,
    /// Hand the inner IP frame to the tun device.
    Deliver,
    /// Transmit the staged datagram to this endpoint.
    Emit(SocketAddr),
}

/// Shared surroundings of a filter invocation.
#[derive(Clone)]
pub struct PfEnv {
    pub conf: Arc<Conf>,
    pub ctl: Arc<CtlBlock>,
    pub log: Logger,
}

impl PfEnv {
    #[inline]
    pub fn local(&self) -> &Node {
        self.ctl.registry.local()
    }
}

/// Per-packet chain context. Node references borrow from the registry behind
/// the environment.
pub struct PfCtx<'e> {
    pub src_node: Option<&'e Node>,
    pub dst_node: Option<&'e Node>,
    /// Next hop the datagram is transmitted to.
    pub fwd_node: Option<&'e Node>,
    /// Adjacent sender of a relay-layer wrap on ingress.
    pub src_fwd_uuid: Option<u64>,

    pub route: Option<RouteHeader>,
    pub relay: RelayPath,
    pub class: ForwardClass,
    /// TTL as received; fixed for the rest of the cycle.
    pub in_ttl: u8,

    pub ip_version: u8,
    pub ip_proto: u8,
    pub dst_ip: Option<IpAddr>,

    pub source_addr: Option<SocketAddr>,

    pub terminal: bool,
    pub action: PfAction,
}

impl<'e> PfCtx<'e> {
    pub fn new() -> PfCtx<'e> {
        PfCtx {
            src_node: None,
            dst_node: None,
            fwd_node: None,
            src_fwd_uuid: None,
            route: None,
            relay: RelayPath::new(),
            class: ForwardClass::Direct,
            in_ttl: 0,
            ip_version: 0,
            ip_proto: 0,
            dst_ip: None,
            source_addr: None,
            terminal: false,
            action: PfAction::None,
        }
    }
}

/// A packet filter. Entry points default to pass-through; a filter overrides
/// the phases it participates in.
pub trait PacketFilter: Send {
    fn name(&self) -> &'static str;
    fn kind(&self) -> FilterKind;

    fn init(&mut self, _env: &PfEnv) {}
    fn conf(&mut self, _env: &PfEnv) {}
    fn release(&mut self, _env: &PfEnv) {}

    fn tun_frame<'e>(&mut self, _env: &'e PfEnv, _ctx: &mut PfCtx<'e>, _buf: &mut PayloadBuf) -> Verdict {
        Verdict::Next
    }

    fn tun_route<'e>(&mut self, _env: &'e PfEnv, _ctx: &mut PfCtx<'e>, _buf: &mut PayloadBuf) -> Verdict {
        Verdict::Next
    }

    fn tun_fwd<'e>(&mut self, _env: &'e PfEnv, _ctx: &mut PfCtx<'e>, _buf: &mut PayloadBuf) -> Verdict {
        Verdict::Next
    }

    fn inet_frame<'e>(&mut self, _env: &'e PfEnv, _ctx: &mut PfCtx<'e>, _buf: &mut PayloadBuf) -> Verdict {
        Verdict::Next
    }

    fn inet_route<'e>(&mut self, _env: &'e PfEnv, _ctx: &mut PfCtx<'e>, _buf: &mut PayloadBuf) -> Verdict {
        Verdict::Next
    }

    fn inet_fwd<'e>(&mut self, _env: &'e PfEnv, _ctx: &mut PfCtx<'e>, _buf: &mut PayloadBuf) -> Verdict {
        Verdict::Next
    }
}

/// Outcome of one complete egress cycle.
#[derive(Debug)]
pub enum TunOutcome {
    Emit(SocketAddr),
    Dropped(Verdict),
}

/// Outcome of one complete ingress cycle.
#[derive(Debug)]
pub enum InetOutcome {
    Deliver,
    Emit(SocketAddr),
    Dropped(Verdict),
}

/// The dispatcher: installed filters plus six phase-ordered index arrays.
pub struct PfChain {
    filters: Vec<Box<dyn PacketFilter>>,
    phases: [Vec<usize>; PHASE_COUNT],
}

impl PfChain {
    pub fn new() -> PfChain {
        PfChain {
            filters: Vec::new(),
            phases: Default::default(),
        }
    }

    /// The canonical chain:
    ///
    /// ```text
    /// tun_frame   dump  -> route
    /// tun_route   route -> zip -> crypto(p2p)
    /// tun_fwd     crypto(relay)
    /// inet_frame  crypto(relay) -> route
    /// inet_route  route -> crypto(p2p) -> zip
    /// inet_fwd    dump  -> route -> crypto(relay)
    /// ```
    pub fn standard() -> PfChain {
        let mut chain = PfChain::new();

        let dump = chain.add(Box::new(dump::DumpFilter::new()));
        let route = chain.add(Box::new(route::RouteFilter::new()));
        let zip = chain.add(Box::new(zip::ZipFilter::new()));
        let p2p = chain.add(Box::new(crypto::CryptoFilter::p2p()));
        let relay = chain.add(Box::new(crypto::CryptoFilter::relay()));

        chain.register(Phase::TunFrame, &[dump, route]).expect("canonical registration");
        chain.register(Phase::TunRoute, &[route, zip, p2p]).expect("canonical registration");
        chain.register(Phase::TunFwd, &[relay]).expect("canonical registration");
        chain.register(Phase::InetFrame, &[relay, route]).expect("canonical registration");
        chain.register(Phase::InetRoute, &[route, p2p, zip]).expect("canonical registration");
        chain.register(Phase::InetFwd, &[dump, route, relay]).expect("canonical registration");

        chain
    }

    /// Installs a filter; returns its handle for phase registration.
    pub fn add(&mut self, filter: Box<dyn PacketFilter>) -> usize {
        self.filters.push(filter);
        self.filters.len() - 1
    }

    /// Appends filters to a phase in invocation order. A peer-to-peer crypto
    /// filter may only enter a route phase behind a route filter: the key
    /// schedule depends on the resolved peer.
    pub fn register(&mut self, phase: Phase, handles: &[usize]) -> Result<(), CoreError> {
        for &handle in handles {
            if handle >= self.filters.len() {
                return Err(CoreError::Config(format!("unknown filter handle {}", handle)));
            }

            let filter = &self.filters[handle];
            let is_p2p_crypto = filter.kind() == FilterKind::Crypto && filter.name().ends_with("p2p");
            let route_phase = phase == Phase::TunRoute || phase == Phase::InetRoute;

            if is_p2p_crypto && route_phase {
                let has_route = self.phases[phase as usize]
                    .iter()
                    .any(|&idx| self.filters[idx].kind() == FilterKind::Route);

                if !has_route {
                    return Err(CoreError::Config(format!(
                        "filter '{}' requires a route filter earlier in the phase",
                        self.filters[handle].name()
                    )));
                }
            }

            self.phases[phase as usize].push(handle);
        }

        Ok(())
    }

    /// Runs the init and configuration hooks of every installed filter.
    pub fn configure(&mut self, env: &PfEnv) {
        for filter in &mut self.filters {
            filter.init(env);
            filter.conf(env);
        }
    }

    pub fn release(&mut self, env: &PfEnv) {
        for filter in &mut self.filters {
            filter.release(env);
        }
    }

    fn run_phase<'e>(
        &mut self,
        phase: Phase,
        env: &'e PfEnv,
        ctx: &mut PfCtx<'e>,
        buf: &mut PayloadBuf,
    ) -> Result<(), Verdict> {
        let PfChain { filters, phases } = self;

        for &idx in &phases[phase as usize] {
            let filter = &mut filters[idx];

            let verdict = match phase {
                Phase::TunFrame => filter.tun_frame(env, ctx, buf),
                Phase::TunRoute => filter.tun_route(env, ctx, buf),
                Phase::TunFwd => filter.tun_fwd(env, ctx, buf),
                Phase::InetFrame => filter.inet_frame(env, ctx, buf),
                Phase::InetRoute => filter.inet_route(env, ctx, buf),
                Phase::InetFwd => filter.inet_fwd(env, ctx, buf),
            };

            match verdict {
                Verdict::Next => continue,
                Verdict::Finish => break,
                verdict => {
                    logging::trace!(env.log, "phase aborted";
                                    "filter" => filters[idx].name(),
                                    "phase" => ?phase,
                                    "verdict" => ?verdict);
                    return Err(verdict);
                }
            }
        }

        Ok(())
    }

    /// Drives one packet from the tun device through the egress chains.
    pub fn run_tun<'e>(&mut self, env: &'e PfEnv, buf: &mut PayloadBuf) -> TunOutcome {
        let mut ctx = PfCtx::new();

        for &phase in &[Phase::TunFrame, Phase::TunRoute, Phase::TunFwd] {
            if let Err(verdict) = self.run_phase(phase, env, &mut ctx, buf) {
                account_abort(env, verdict);
                return TunOutcome::Dropped(verdict);
            }
        }

        match ctx.action {
            PfAction::Emit(addr) => TunOutcome::Emit(addr),
            _ => {
                account_abort(env, Verdict::Error);
                logging::error!(env.log, "egress cycle completed without a transmit target");
                TunOutcome::Dropped(Verdict::Error)
            }
        }
    }

    /// Drives one received datagram through the ingress chains.
    pub fn run_inet<'e>(&mut self, env: &'e PfEnv, buf: &mut PayloadBuf, source: SocketAddr) -> InetOutcome {
        let mut ctx = PfCtx::new();
        ctx.source_addr = Some(source);

        for &phase in &[Phase::InetFrame, Phase::InetRoute] {
            if let Err(verdict) = self.run_phase(phase, env, &mut ctx, buf) {
                account_abort(env, verdict);
                return InetOutcome::Dropped(verdict);
            }
        }

        if ctx.terminal {
            return InetOutcome::Deliver;
        }

        if let Err(verdict) = self.run_phase(Phase::InetFwd, env, &mut ctx, buf) {
            account_abort(env, verdict);
            return InetOutcome::Dropped(verdict);
        }

        match ctx.action {
            PfAction::Emit(addr) => InetOutcome::Emit(addr),
            _ => {
                account_abort(env, Verdict::Error);
                logging::error!(env.log, "transit cycle completed without a transmit target");
                InetOutcome::Dropped(Verdict::Error)
            }
        }
    }
}

fn account_abort(env: &PfEnv, verdict: Verdict) {
    let status = &env.ctl.status;

    match verdict {
        Verdict::NoRoute => {
            status.noroute_frames.fetch_add(1, Ordering::Relaxed);
        }
        _ => {
            status.drop_frames.fetch_add(1, Ordering::Relaxed);
        }
    }
}
