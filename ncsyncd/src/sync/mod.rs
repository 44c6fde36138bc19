pub mod e2ee;
pub mod engine;
pub mod error;
pub mod index;
pub mod live_photo;
pub mod paths;
mod upload;

#[cfg(test)]
pub(crate) mod testing;
