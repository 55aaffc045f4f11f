// src/lib.rs

#![doc = r#"
# filehub

filehub tells every connected viewer, in real time, when a file is created or
deleted. Viewers connect over a WebSocket; a single hub owns the roster of
connected clients and fans each event out to all of them.

## Modules

- [`config`]: Configuration loading and merging from CLI, file, and environment.
- [`event`]: File events and their `{action, file}` wire frames.
- [`mailbox`]: Bounded per-client delivery queues and their drop policy.
- [`hub`]: The single loop that serializes registration, deregistration, and broadcast.
- [`connection`]: Per-client read and write pumps.
- [`handshake`]: Origin check for WebSocket upgrades.
- [`watcher`]: Optional file system watcher feeding the hub.
- [`web`]: HTTP router, WebSocket endpoint, and static assets.
"#]

pub mod config;
pub mod connection;
pub mod event;
pub mod handshake;
pub mod hub;
pub mod mailbox;
pub mod watcher;
pub mod web;
