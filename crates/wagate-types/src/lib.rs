//! Shared types for the wagate connection gateway.

mod api;
mod identity;
mod session;
mod ws;

pub use api::*;
pub use identity::*;
pub use session::*;
pub use ws::*;
