//! inputd: subscription matching and event distribution for a multimodal
//! input service
//!
//! The service receives normalized key and pointer events and routes them to
//! client processes according to what each one declared interest in: single
//! keys and chords, system hotkeys, key monitors, raw event monitors and
//! exclusive interceptors.

pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod handoff;
pub mod hotkey;
pub mod ipc;
pub mod lifecycle;
pub mod pipeline;
pub mod registry;
