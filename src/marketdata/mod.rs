pub mod client;
pub mod csv_file;
pub mod simulator;
