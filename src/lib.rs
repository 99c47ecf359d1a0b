pub mod admin;
pub mod backup;
pub mod config;
pub mod console;
pub mod notify;
pub mod process;
pub mod provision;
pub mod registry;
pub mod runtime;
pub mod utils;
