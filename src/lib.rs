//! Library surface for the silo field monitor, split from `main.rs` the way
//! `comsrv/src/lib.rs` separates the binary's wiring from its reusable
//! modules — integration tests exercise these directly instead of spawning
//! the whole process.

pub mod alerts;
pub mod bus;
pub mod config;
pub mod database_reader;
pub mod error;
pub mod http;
pub mod logging;
pub mod modbus;
pub mod persistence;
pub mod reader;
pub mod scheduler;
pub mod state;
pub mod validator;
