//! # campus-core
//!
//! Core types for the Campus messaging service:
//! - The domain model: users, chat groups, private chats, messages
//! - The socket wire protocol: client and server events
//!
//! This crate has no network code and no storage code.
//! It is the foundation the relay server builds on.

pub mod events;
pub mod model;
