pub mod audit;
pub mod config;
pub mod context;
pub mod errors;
pub mod gates;
pub mod health;
pub mod init;
pub mod logging;
pub mod orchestrator;
pub mod retry;
pub mod role;
pub mod sync;
pub mod tracker;
pub mod util;
pub mod vcs;
pub mod weave_config;
