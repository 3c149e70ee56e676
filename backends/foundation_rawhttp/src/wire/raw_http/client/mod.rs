// Raw HTTP Client Module
//
// Single-shot and pipelining clients over a DNS caching, admission bounded
// dialer with optional proxy tunnels and TLS.

mod admission;
mod client;
mod connection;
mod dialer;
mod dns;
mod errors;
mod options;
mod pipeline;
mod pool;
mod proxy;
mod redirects;
mod registry;

pub use admission::*;
pub use client::*;
pub use connection::*;
pub use dialer::*;
pub use dns::*;
pub use errors::*;
pub use options::*;
pub use pipeline::*;
pub use pool::*;
pub use proxy::*;
pub use redirects::*;
pub use registry::*;
