pub mod btle;
pub mod constants;
pub mod control;
pub mod events;
pub mod session;
pub mod simulated;
pub mod transport;
pub mod types;
