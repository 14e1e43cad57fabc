//! # nodelink
//!
//! MQTT connectivity for a small networked node: keeps the broker session
//! alive across WiFi drops, builds per-node topics, publishes status and debug
//! messages and hands inbound JSON commands to the device.
//!
//! - [`config`] - TOML node configuration
//! - [`mqtt`] - topics, inbound messages, command decoding, rumqttc session
//! - [`link`] - connectivity glue, WiFi links, retry timer and runtime task

pub mod config;
pub mod link;
pub mod mqtt;
