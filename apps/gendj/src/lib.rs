pub mod app;
pub mod cli;
pub mod config;
pub mod deck;
pub mod frame;
pub mod midi;
pub mod notice;
pub mod session;
pub mod telemetry;
pub mod transport;
