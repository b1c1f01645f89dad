use crate::net::payload::{sub, PayloadBuf};
use crate::net::route::ROUTE_HEADER_SIZE;
use crate::pf::{FilterKind, PacketFilter, PfCtx, PfEnv, Verdict};
use flate2::write::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;
use sett::logging;
use std::io::Write;
use std::sync::atomic::Ordering;

/// Segments below this size are not worth compressing.
const ZIP_MIN_SIZE: usize = 128;

/// Stateless deflate over the payload segment. Sender opt-in via
/// configuration; the receive side always honors the sub-type bit regardless
/// of local settings.
pub struct ZipFilter {
    enabled: bool,
    level: u32,
}

impl ZipFilter {
    pub fn new() -> ZipFilter {
        ZipFilter {
            enabled: false,
            level: 6,
        }
    }
}

impl PacketFilter for ZipFilter {
    fn name(&self) -> &'static str {
        "zip"
    }

    fn kind(&self) -> FilterKind {
        FilterKind::Compress
    }

    fn conf(&mut self, env: &PfEnv) {
        self.enabled = env.conf.zip_enable;
        self.level = env.conf.zip_level;
    }

    fn tun_route<'e>(&mut self, env: &'e PfEnv, _ctx: &mut PfCtx<'e>, buf: &mut PayloadBuf) -> Verdict {
        if !self.enabled {
            return Verdict::Next;
        }

        let segment_len = buf.body_len().saturating_sub(ROUTE_HEADER_SIZE);
        if segment_len < ZIP_MIN_SIZE {
            return Verdict::Next;
        }

        let mut encoder = DeflateEncoder::new(Vec::with_capacity(segment_len), Compression::new(self.level));
        let compressed = encoder
            .write_all(&buf.body()[ROUTE_HEADER_SIZE..])
            .and_then(|_| encoder.finish());

        let compressed = match compressed {
            Ok(data) => data,
            Err(err) => {
                logging::debug!(env.log, "deflate failed, sending raw"; "error" => %err);
                return Verdict::Next;
            }
        };

        // Keep the raw segment when compression does not pay off.
        if compressed.len() >= segment_len {
            return Verdict::Next;
        }

        buf.body_space_mut()[ROUTE_HEADER_SIZE..ROUTE_HEADER_SIZE + compressed.len()]
            .copy_from_slice(&compressed);

        if buf.set_body_len(ROUTE_HEADER_SIZE + compressed.len()).is_err() {
            return Verdict::Error;
        }

        buf.or_sub_type(sub::ZIP);
        Verdict::Next
    }

    fn inet_route<'e>(&mut self, env: &'e PfEnv, _ctx: &mut PfCtx<'e>, buf: &mut PayloadBuf) -> Verdict {
        if buf.sub_type() & sub::ZIP == 0 {
            return Verdict::Next;
        }

        let segment_len = buf.body_len().saturating_sub(ROUTE_HEADER_SIZE);

        let mut decoder = DeflateDecoder::new(Vec::with_capacity(segment_len * 2));
        let inflated = decoder
            .write_all(&buf.body()[ROUTE_HEADER_SIZE..])
            .and_then(|_| decoder.finish());

        let inflated = match inflated {
            Ok(data) => data,
            Err(err) => {
                logging::debug!(env.log, "inflate failed"; "error" => %err);
                env.ctl.status.framing_drop_frames.fetch_add(1, Ordering::Relaxed);
                return Verdict::Drop;
            }
        };

        if ROUTE_HEADER_SIZE + inflated.len() > buf.capacity() - crate::net::payload::HEADER_SIZE {
            env.ctl.status.framing_drop_frames.fetch_add(1, Ordering::Relaxed);
            return Verdict::Drop;
        }

        buf.body_space_mut()[ROUTE_HEADER_SIZE..ROUTE_HEADER_SIZE + inflated.len()].copy_from_slice(&inflated);

        if buf.set_body_len(ROUTE_HEADER_SIZE + inflated.len()).is_err() {
            return Verdict::Error;
        }

        buf.clear_sub_type(sub::ZIP);
        Verdict::Next
    }
}
