//! Wagate server library - HTTP/WebSocket front end for the connection registry.
//!
//! Routes, the event WebSocket and application state live here so integration
//! tests can drive the router without binding a socket.

pub mod config;
pub mod global_ws;
pub mod logging;
pub mod routes;
pub mod state;
