#[macro_use]
extern crate tracing;

pub mod builtins;
pub mod cancel;
pub mod cmd;
pub mod config;
pub mod console;
pub mod env;
pub mod error;
pub mod parse;
pub mod prelude;
pub mod process;
pub mod shell;

pub use shell::Shell;
