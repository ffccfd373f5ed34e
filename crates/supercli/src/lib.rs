//! An interactive coding agent for the terminal that works with hosted and
//! local OpenAI-compatible providers.
//!
//! The binary is a thin REPL around [`App`]: lines starting with `/` go to
//! [`commands::dispatch`], everything else becomes a conversation turn.

#[macro_use]
extern crate tracing;

mod app;
pub mod commands;
pub mod config;
pub mod tools;
pub mod ui;

pub use app::{App, AppError, AppOptions, Hooks, Resume};
