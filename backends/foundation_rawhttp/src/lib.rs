extern crate url;

pub mod netcap;
pub mod wire;
