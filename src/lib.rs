// Library crate shared by the binary and the integration tests.

pub mod config;
pub mod error;
pub mod history;
pub mod measurement;
pub mod runner;
pub mod scheduler;
pub mod settings;
pub mod validator;
