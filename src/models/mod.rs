//! Data models

mod params;
mod pool;
mod server;
mod vm;

pub use params::*;
pub use pool::*;
pub use server::*;
pub use vm::*;
