//! Syncline server: SSE channel relay over a pub/sub broker, TTL presence
//! register, and a sequenced chat log with last-writer-wins upserts.

pub mod app_state;
pub mod broker;
pub mod db;
pub mod handlers;
pub mod http;
pub mod middleware;
pub mod openapi;
pub mod relay;
pub mod routes;
pub mod server;
pub mod services;
pub mod tracer;
