pub mod api;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod intake;
pub mod ledger;
pub mod queue;
pub mod retry;
pub mod server;
pub mod settlement;
pub mod status;
pub mod webhook;
pub mod worker;
