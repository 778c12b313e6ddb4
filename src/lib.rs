//! tutorchat - classroom chat server with timed per-tutorial rooms and attendance tracking
//!
//! This crate provides the core functionality for tutorchat, including:
//! - Authentication and session tracking
//! - Per-tutorial chat rooms with primary and chat sockets
//! - Timed chat sessions with an expiry warning
//! - Student presence and attendance accounting
//!
//! # Architecture
//!
//! tutorchat uses a client-server model where:
//! - The server (`tutorchat-server`) accepts TCP connections and runs one task per connection
//! - Clients speak a line-based, pipe-delimited text protocol
//! - Persistent data lives behind the [`store::Store`] trait (SQLite or in-memory)

pub mod auth;
pub mod client;
pub mod config;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod server;
pub mod store;
