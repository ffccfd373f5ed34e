//! Core logic including the conversation loop, model request handling and
//! tool execution.

#![deny(missing_docs)]
#![deny(clippy::missing_safety_doc)]

#[macro_use]
extern crate tracing;

mod engine;
mod error;
mod model_client;
mod rate_limit;
pub mod retry;
pub mod tool;

pub use engine::{
    Engine, EngineBuilder, EngineState, TurnContext, TurnEnd, TurnOutcome,
};
pub use error::{EngineError, ModelError};
pub use model_client::{ModelClient, ModelClientResponse};
pub use retry::RetryPolicy;
