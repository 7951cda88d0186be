//! Event types published by the engine for UI and host collaborators.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them over whatever bus it uses (JSON lines, a webview bridge).

pub mod events;
