mod account;
mod addr;
mod auth;
mod cipher;
mod client;
mod config;
mod monitor;
mod packet;
mod registry;
mod relay;
mod session;

const MAX_UDP_SIZE: usize = (1 << 16) - 1;

pub use account::*;
pub use addr::*;
pub use auth::*;
pub use cipher::CipherError;
pub use client::*;
pub use config::*;
pub use monitor::*;
pub use registry::*;
pub use relay::*;
pub use session::*;
