pub mod approval;
pub mod config;
pub mod engine;
pub mod poller;
pub mod present;
pub mod reconcile;
pub mod runtime;
pub mod shared;
pub mod transport;
