//! # MQTT Module
//!
//! Everything the node needs to talk to its broker, independent of how the
//! connection is kept alive (that lives in [`crate::link`]).
//!
//! ```text
//! mqtt/
//! ├── command.rs          - JSON command decoding
//! ├── message_manager.rs  - Inbound messages and chunk reassembly
//! ├── mqtt_handler.rs     - rumqttc session and event loop driver
//! └── topic.rs            - Topic templating and parsing
//! ```
//!
//! Topics follow `<root><template>` with `{nodeid}` replaced by the node id,
//! so node 5 under root `home/` listens for commands on `home/5/CMD` and
//! reports on `home/5/STATUS` and `home/5/DEBUG`.

pub mod command;
pub mod message_manager;
pub mod mqtt_handler;
pub mod topic;
