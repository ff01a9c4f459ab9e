//! Contains all of the types needed to specify options to the client.
//!
//! Most of the options structs in this module use the
//! [`typed-builder`](https://crates.io/crates/typed-builder) crate to derive a type-safe builder
//! API on them.

pub use crate::{
    client::{auth::*, options::*},
    cmap::options::ConnectionPoolOptions,
    compression::Compressor,
    concern::*,
    selection_criteria::*,
};
