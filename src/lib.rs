pub mod command;
pub mod config;
pub mod engine;
pub mod errors;
pub mod fakes;
pub mod locking;
pub mod models;
pub mod policy;
pub mod project;
pub mod report;
pub mod runner;
pub mod server;
pub mod vcs;
