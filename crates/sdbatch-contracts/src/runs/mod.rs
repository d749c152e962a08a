pub mod cache;
pub mod query;
pub mod summary;
