// Public API for integration tests and potential library usage

pub mod api;
pub mod broadcast;
pub mod channel;
pub mod config;
pub mod lock;
pub mod protocol;
pub mod state;
pub mod store;
pub mod timer;
pub mod types;
pub mod ws;
