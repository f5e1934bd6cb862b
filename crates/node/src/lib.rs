//! proglog node: the process that hosts one member of a proglog cluster.

pub mod agent;
pub mod config;

pub use agent::Agent;
pub use config::Config;
