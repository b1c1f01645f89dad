//! Wire framing: the datagram envelope and the route header carried by
//! forwarded IP frames.

pub mod payload;
pub mod route;
