//! # guisrv Common Library
//!
//! Shared code for the guisrv gateway and its deployment worker:
//! - Bundle model and well-formedness validation
//! - Worker wire protocol (gateway ⇄ deployer process)
//! - Deployment plans and change sets
//! - Event types and the EventBus
//! - Configuration loading
//! - Utility functions

pub mod bundle;
pub mod config;
pub mod error;
pub mod events;
pub mod plan;
pub mod protocol;
pub mod time;

pub use bundle::{Bundle, BundleError};
pub use error::{Error, Result};
