//! # Core
//!
//! Core provides the resource state machine and the error types shared by all
//! resources.

pub mod error;
pub use error::*;

pub mod resource;
pub use resource::*;
