pub mod cli;
pub mod config;
pub mod hypervisor;
pub mod metrics;
pub mod network;
pub mod provisioning;
pub mod registration;
pub mod reporting;
pub mod scheduling;
pub mod server;
