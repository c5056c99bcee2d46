pub mod config;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod routing;
pub mod server;
pub mod upstream;
