//! Public interface to the dfstore core library, linked by the master, node,
//! and client executables.

#[macro_use]
mod utils;

pub mod chunk;
pub mod client;
pub mod master;
pub mod node;

pub use utils::{logger_init, set_me, DfsError, ME};
