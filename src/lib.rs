#![warn(rust_2018_idioms)]

pub mod config;
pub mod context;
pub mod cryptor;
mod error;
pub mod frame;
pub mod handler;
pub mod key_derivation;
mod key_ring;
pub mod red;

pub use error::{Error, Result};
