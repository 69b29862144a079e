#[macro_use]
extern crate log;
#[macro_use]
extern crate enum_primitive;

pub mod base_acquirer;
pub mod coordinates;
pub mod engine_config;
pub mod error;
pub mod nmea;
pub mod orchestrator;
pub mod poll;
pub mod receiver;
pub mod session;
pub mod settings;
pub mod solution;
pub mod station_file;
pub mod stream_verifier;
pub mod supervisor;
