// EMA Gateway
//
// Copyright: 2026, EMA Project
// License: Public Domain License

/// CR-LF framing of the inbound byte stream
pub mod framer;
/// Status bulletin decoding into the reading vector
pub mod status;
/// Request/response commands and device-side parameters
pub mod command;
