pub mod allocator;
pub mod store;
