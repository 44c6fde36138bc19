pub mod crypto;
pub mod lock;
pub mod manifest;
pub mod synchronizer;
