pub mod config;
pub mod dap;
pub mod log;
pub mod net;
pub mod runtime;
pub mod server;
pub mod session;
