pub mod config;
pub mod database;
pub mod exclude;
pub mod probe;
pub mod processing;
pub mod protocols;
pub mod scanner;
pub mod terminal_colors;
pub mod tracing;
