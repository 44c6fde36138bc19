pub mod account;
pub mod config;
pub mod events;
pub mod sync;
