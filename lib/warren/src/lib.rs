//! `warren` is the packet forwarding engine of a peer-to-peer overlay
//! network: a bidirectional pipeline moving IP packets between a tun device
//! and authenticated, encrypted UDP, through a configurable chain of packet
//! filters over a shared control block.

pub mod conf;
pub mod core;
pub mod ctl;
pub mod error;
pub mod net;
pub mod node;
pub mod pf;
pub mod registry;
pub mod tun;
pub mod worker;
