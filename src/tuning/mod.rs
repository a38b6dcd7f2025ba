pub mod persist;
pub mod search;
