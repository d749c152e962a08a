pub mod catalog;
pub mod config;
pub mod errors;
pub mod events;
pub mod runs;
