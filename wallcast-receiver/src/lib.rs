//! # wallcast-receiver: Display Node Service
//!
//! Runs on each display node. Accepts the block streams of every sender
//! of an application, merges them into whole frames in a ring buffer and
//! drains them with a local consumer. Optionally relays the received
//! blocks to further nodes with a bridge streamer.

pub mod config;
pub mod consumer;
pub mod service;
