//! quilt-jail - run quilt inside an nsjail sandbox
//!
//! Builds an nsjail mount policy for the current package directory,
//! renders it to nsjail's text configuration format, and runs quilt (or an
//! interactive shell) under it so patch operations can only touch the
//! package tree and a handful of build locations.

pub mod config;
pub mod context;
pub mod error;
pub mod policy;
pub mod sandbox;
pub mod utils;
