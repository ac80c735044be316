//! HTTP surface: read-only REST routes and the push WebSocket.

pub mod error;
pub mod hub;
pub mod rest;
pub mod ws;

pub use rest::router;
