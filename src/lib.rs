#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
pub mod cluster;
pub mod config;
mod controller;
pub mod diff;
pub mod opnsense;

pub use config::Config;
pub use controller::run;
pub use opnsense::OpnsenseClient;
