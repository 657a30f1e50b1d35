//! # avbridge-agent: media redirection agent
//!
//! Runs a redirection session against a remote peer using synthetic
//! capture devices (a sine tone and a moving test pattern) and a render
//! sink that logs what the peer sends back.
//!
//! ## Modes
//!
//! - **Connect**: dial the remote endpoint (default).
//! - **Listen**: accept a single peer, e.g. a second agent.

pub mod config;
pub mod devices;
pub mod service;
