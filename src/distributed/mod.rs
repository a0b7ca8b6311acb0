//! Distributed exchange of elite walkers across independent swarms.

mod driver;
mod exchange;
mod server;

pub use driver::*;
pub use exchange::*;
pub use server::*;
