//! HTTP route handlers

pub mod query;
