//! # convoy-server
//!
//! Device agent for convoy. Composes the session services from
//! configuration and exposes them to the app shell over a local REST API.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod state;
