//! Storage module for ClawMate
//!
//! - `json`: JSON file load/save for configuration

mod json;

pub use json::JsonStore;
