use crate::net::payload::PayloadBuf;
use crate::net::route::ROUTE_HEADER_SIZE;
use crate::pf::{FilterKind, PacketFilter, PfCtx, PfEnv, Verdict};
use sett::logging;

const DUMP_BYTES: usize = 16;

/// Diagnostics filter: hexdumps packet heads at trace level when `if_dump`
/// is configured. Never alters the packet.
pub struct DumpFilter {
    enabled: bool,
}

impl DumpFilter {
    pub fn new() -> DumpFilter {
        DumpFilter { enabled: false }
    }

    fn dump(&self, env: &PfEnv, ctx: &PfCtx, buf: &PayloadBuf, context: &'static str) {
        if !self.enabled {
            return;
        }

        let frame = &buf.body()[ROUTE_HEADER_SIZE.min(buf.body_len())..];

        logging::trace!(env.log, "packet dump";
                        "context" => context,
                        "ip_version" => ctx.ip_version,
                        "ip_proto" => ctx.ip_proto,
                        "body_len" => buf.body_len(),
                        "head" => hex_head(frame));
    }
}

fn hex_head(frame: &[u8]) -> String {
    frame
        .iter()
        .take(DUMP_BYTES)
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

impl PacketFilter for DumpFilter {
    fn name(&self) -> &'static str {
        "dump"
    }

    fn kind(&self) -> FilterKind {
        FilterKind::Dump
    }

    fn conf(&mut self, env: &PfEnv) {
        self.enabled = env.conf.if_dump;
    }

    fn tun_frame<'e>(&mut self, env: &'e PfEnv, ctx: &mut PfCtx<'e>, buf: &mut PayloadBuf) -> Verdict {
        self.dump(env, ctx, buf, "tun_frame");
        Verdict::Next
    }

    fn inet_fwd<'e>(&mut self, env: &'e PfEnv, ctx: &mut PfCtx<'e>, buf: &mut PayloadBuf) -> Verdict {
        self.dump(env, ctx, buf, "inet_fwd");
        Verdict::Next
    }
}
