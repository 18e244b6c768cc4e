//! tickmud: a single-loop MUD runtime.
//!
//! The gateway process owns player sockets; this crate is the game core it
//! talks to. Everything mutable lives in a [`world::World`] driven by one
//! control loop ([`runtime::Runtime`]); what can happen to it is declared
//! once up front in a [`registry::Registry`].

pub mod attr;
pub mod codec;
pub mod config;
pub mod entity;
pub mod error;
pub mod events;
pub mod fabric;
pub mod pulse;
pub mod registry;
pub mod reload;
pub mod runtime;
pub mod session;
pub mod shell;
pub mod starter;
pub mod store;
pub mod world;

pub use entity::EntityId;
pub use error::{Error, Result};
pub use mudwire::ConnId;
