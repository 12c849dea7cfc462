pub mod alerting;
pub mod build_info;
pub mod classifier;
pub mod cli;
pub mod commands;
pub mod config;
pub mod crawler;
pub mod db;
pub mod ledger;
pub mod logging;
pub mod metrics_provider;
pub mod queue;
pub mod server;
pub mod state;
