pub mod chat;
pub mod config;
pub mod error;
pub mod message;
pub mod model;
pub mod provider;
pub mod retry;
pub mod store;
pub mod usage;
pub mod window;

#[cfg(test)]
mod tests;
