pub mod client;
pub mod simulator;
