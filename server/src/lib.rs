pub mod applog;
pub mod channel;
pub mod config;
pub mod conn;
pub mod metrics;
pub mod query;
pub mod querylog;
pub mod resolve;
pub mod resource;
pub mod sock;
pub mod worker;
