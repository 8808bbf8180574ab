//! Historical chart aggregation over stored weight and fill samples.

pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod query;
pub mod source;
