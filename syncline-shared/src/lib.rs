#![cfg_attr(not(test), forbid(unsafe_code))]
#![deny(warnings, clippy::pedantic)]
#![allow(clippy::multiple_crate_versions)]

//! Shared wire models and configuration for the Syncline platform.
//!
//! Everything that crosses a process boundary lives here: the live-update
//! envelope, presence diffs, chat message rows, channel naming, and the
//! server configuration schema.

pub mod config;
pub mod models;
