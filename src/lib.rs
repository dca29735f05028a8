//! Sealskin: a multi-tenant application session broker.
//!
//! Authenticated users ask for a packaged GUI application; the broker starts
//! it in an isolated container, authenticates the user against it, and
//! proxies all HTTP and WebSocket traffic for the session, optionally
//! multiplexed into a collaboration room.

#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]
#![warn(unreachable_pub)]
#![warn(elided_lifetimes_in_paths)]
#![deny(unused_must_use)]

/// Control-plane HTTP API.
pub mod api;
/// Installed apps, stores, templates and environment composition.
pub mod apps;
/// On-disk autostart script cache.
pub mod autostart;
/// Wiring of every engine behind one value.
pub mod broker;
/// Collaboration rooms and the downstream control plane.
pub mod collab;
/// Settings from `SEALSKIN_` environment variables.
pub mod config;
/// Core domain types and the error sum.
pub mod core;
/// End-to-end encrypted control channel.
pub mod crypto;
/// User, admin and group storage.
pub mod directory;
/// Bearer-token identity and auth guards.
pub mod identity;
/// Image metadata cache and pull coordination.
pub mod images;
/// Periodic background jobs.
pub mod jobs;
/// The launch engine.
pub mod launch;
/// Container-to-host path translation.
pub mod paths;
/// Per-session reverse proxy.
pub mod proxy;
/// Container runtime capability (Docker, mock).
pub mod runtime;
/// Listener plumbing.
pub mod server;
/// Public file shares.
pub mod shares;
/// User storage and chunked uploads.
pub mod storage;
/// Durable session store.
pub mod store;
/// Small shared helpers.
pub mod util;
