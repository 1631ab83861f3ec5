//! # captcha-dispatch
//!
//! Hands a scarce, externally sourced pool of captchas to anonymous clients.
//! Each client holds at most one captcha; everyone else waits in a FIFO
//! queue. Captchas whose owners go silent, or that vanish upstream, are
//! reclaimed.

pub mod api;
pub mod config;
pub mod error;
pub mod identity;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod upstream;
