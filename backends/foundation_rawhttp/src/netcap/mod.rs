pub mod errors;
pub use errors::*;

mod deadline;
pub use deadline::*;

mod connection;
pub use connection::*;

pub mod ssl;
