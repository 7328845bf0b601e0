//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod safetcp;

pub use error::DfsError;
pub use print::{logger_init, set_me, ME};

pub(crate) use safetcp::{
    read_header_line, read_payload, read_up_to, tcp_bind_with_retry,
    tcp_connect_with_timeout, write_framed,
};
