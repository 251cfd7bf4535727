pub mod azure;
pub mod cluster;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod interrupt;
pub mod progress;
pub mod runcmd;
pub mod target;
pub mod vmss;
