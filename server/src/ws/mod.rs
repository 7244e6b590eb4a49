pub mod actor;
pub mod event;
pub mod handler;
pub mod handshake;
pub mod registry;
