pub mod client;
pub mod config;
pub mod mapping;
pub mod messages;
pub mod motor;
pub mod runtime;
pub mod session;
pub mod smoother;
