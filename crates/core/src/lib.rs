//! `conductor-core`: primitives shared by the call model and the dispatcher.
//!
//! This crate has no infrastructure concerns: identifiers, the contract error
//! model, and the restricted value type that call arguments are made of.

pub mod error;
pub mod id;
pub mod value;

pub use error::{CallError, CallResult};
pub use id::{JobId, TaskId};
pub use value::Value;
