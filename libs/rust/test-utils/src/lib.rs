//! Shared test utilities for the outbound pipeline and its services.
//!
//! This crate provides:
//! - Proptest generators for status codes, URLs and policy settings
//! - A scripted mock transport and a log capture layer
//! - Test fixtures with sample requests and contexts

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod generators;
pub mod mocks;
pub mod fixtures;

pub use generators::*;
pub use mocks::{CapturedEvent, LogCapture, MockOutcome, MockTransport};
