//! Remote, browser-accessible development workspaces.
//!
//! Two processes share this crate: the Worker owns a workspace directory
//! (files, PTYs, a watcher, content-addressed snapshots) behind a single
//! upstream websocket, and the Bridge multiplexes many frontend websockets
//! onto that one connection.

pub mod bridge;
pub mod bus;
pub mod config;
pub mod fs_service;
pub mod hydrate;
pub mod proto;
pub mod router;
pub mod sandbox;
pub mod snapshot;
pub mod terminal;
pub mod upstream;
pub mod util;
pub mod watcher;
pub mod worker;
