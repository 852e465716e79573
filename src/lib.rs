//! Bluetooth HID host driver for the iPega PG-9021 gamepad
//!
//! Drives the connection lifecycle with one paired peripheral over an
//! injected host stack and turns its input reports into debounced button,
//! D-pad and smoothed thumbstick events.
//!
//! - [`bluetooth`] - Connection state machine, driver task, replay stack
//! - [`sdp`] - Discovery attribute decoding
//! - [`gamepad`] - Report decoding and event normalization
//! - [`config`] - Configuration file

pub mod bluetooth;
pub mod config;
pub mod gamepad;
pub mod sdp;
