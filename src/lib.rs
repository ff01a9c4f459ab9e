#![doc = include_str!("../README.md")]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub use ::bson;

pub use crate::{
    client::{session::ClusterTime, Client},
    sdam::public::{ServerInfo, ServerType, TopologyType},
};

pub mod error;
pub mod event;
pub mod options;

// The core subsystems: discovery/monitoring (sdam), per-server pooling (cmap), and the
// operation execution loop (client), plus the support modules they share.
mod bson_util;
mod client;
mod cmap;
mod compression;
mod concern;
mod hello;
mod operation;
pub(crate) mod runtime;
mod sdam;
mod selection_criteria;
#[cfg(feature = "dns-resolver")]
mod srv;

#[cfg(test)]
mod test;

/// A boxed future.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
