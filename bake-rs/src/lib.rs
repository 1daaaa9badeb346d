pub mod cli;
pub mod config;
pub mod log;
pub mod project;
pub mod script;
pub mod var;
