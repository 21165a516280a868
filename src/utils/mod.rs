//! Shared utility modules.
//!
//! Currently only the protobuf text format writer and reader used for
//! nsjail configuration files.

pub mod textproto;
