#[cfg(feature = "ssl-rustls")]
mod rustls;

#[cfg(feature = "ssl-rustls")]
pub use self::rustls::*;

#[cfg(not(feature = "ssl-rustls"))]
mod disabled;

#[cfg(not(feature = "ssl-rustls"))]
pub use disabled::*;
