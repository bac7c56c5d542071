//! HTTP endpoints for probes and metrics scraping

mod dto;
mod handlers;
mod server;

pub use server::{run_server, ApiState};
