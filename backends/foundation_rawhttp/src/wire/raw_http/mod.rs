// Raw HTTP/1.x Module
//
// Wire message model, raw request patching and the clients built on top of
// them. Requests are serialized exactly as described by their fields (or by
// their raw override bytes), never normalized.

mod errors;
mod model;
mod patcher;
mod response;

pub mod client;

pub use errors::*;
pub use model::*;
pub use patcher::*;
pub use response::*;
