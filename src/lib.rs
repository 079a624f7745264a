//! The connection management and server discovery core of the MongoDB Rust
//! driver.
//!
//! This crate contains the machinery that turns a connection string into a
//! live, self-healing client: initial seedlist discovery (including
//! `mongodb+srv` DNS resolution), server discovery and monitoring (SDAM),
//! server selection, per-server connection pooling, and client/server
//! sessions with transaction support.
//!
//! The wire protocol itself is abstracted: connections exchange opaque BSON
//! documents over a [`WireChannel`](cmap::WireChannel) supplied by a
//! [`Connector`](cmap::Connector) at client construction. Authentication
//! mechanisms, codecs, and the CRUD API live in higher layers.
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub use ::bson;

mod client;
pub mod cmap;
mod concern;
pub mod error;
pub mod event;
mod hello;
pub mod options;
pub(crate) mod runtime;
mod sdam;
mod selection_criteria;
mod srv;
#[cfg(test)]
mod test;

pub use crate::{
    client::{
        session::{ClientSession, ClusterTime},
        Client,
    },
    concern::{Acknowledgment, ReadConcern, ReadConcernLevel, WriteConcern},
    selection_criteria::{
        ReadPreference,
        ReadPreferenceOptions,
        ReadPreferenceWithFallback,
        SelectionCriteria,
        TagSet,
    },
};

pub use sdam::public::*;

/// A boxed future.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
