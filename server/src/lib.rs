//! Hestate Server - HTTP platform for the Hestate property marketplace.
//!
//! This crate provides the shared server foundation that domain route groups
//! plug into:
//! - A typed error taxonomy and the request error boundary
//! - A not-found fallback for unmatched routes
//! - Configuration, structured logging and a supervised database connection
//! - Signed cookie sessions and standard security middleware
//! - Realtime WebSocket messaging fanned out across processes through Redis
//!
//! # Architecture
//!
//! Handlers return [`boundary::HandlerResult`]; every failure they raise is
//! classified by the boundary as either a known [`error::AppError`] or an
//! unknown failure. [`app::Application`] wires the components together in
//! startup order.

pub mod app;
pub mod boundary;
pub mod config;
pub mod database;
pub mod error;
pub mod extract;
pub mod logging;
pub mod realtime;
pub mod routes;
pub mod security;
pub mod server;
pub mod session;
