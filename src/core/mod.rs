//! Core runtime infrastructure.
//!
//! This module contains the essential components for running Strata:
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Main runtime orchestration
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod runtime;
