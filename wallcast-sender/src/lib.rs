//! # wallcast-sender: Frame Streaming Service
//!
//! Runs one `Streamer` for a window: connects to the receivers named in
//! the connection descriptor, feeds the streamer frames from a synthetic
//! producer, and accepts reconfiguration lines on a TCP control port.
//!
//! ## Control lines
//!
//! - `"<n> (<rcvId> <x> <y> <w> <h>)*"`: new layout, applied at the next frame
//! - `"rate <fps>"`: frame-rate change
//! - `"stats"`, `"resend"`

pub mod config;
pub mod control;
pub mod service;
pub mod source;
