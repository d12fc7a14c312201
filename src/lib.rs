//! `splitstream` is a feature-flagging and experimentation SDK: it parses a
//! versioned JSON datafile into an immutable project configuration,
//! deterministically buckets users into variations, evaluates audience
//! targeting, and batches impression/conversion events for delivery.
//!
//! # Overview
//!
//! The crate is organized as a set of building blocks around a central
//! [`Client`]:
//!
//! - [`datafile`]: the parsed, indexed project configuration.
//! - [`bucketer`]: MurmurHash3-based deterministic bucketing.
//! - [`conditions`]: tri-valued audience condition evaluation.
//! - [`decision`]: the layered decision pipeline.
//! - [`events`]: impression/conversion payloads, batching, and dispatch.
//! - [`config_manager`] / [`config_store`]: datafile polling and atomic
//!   configuration swaps.
//! - [`cmab`] / [`segments`] / [`user_profile`]: pluggable seams for
//!   bandit decisions, audience segments, and sticky-bucketing storage.
//!
//! Decisions are a pure function of (configuration, user id, attributes,
//! optional persisted profile): there is no randomness anywhere in the
//! decision path.
//!
//! # Examples
//! ```no_run
//! # fn test(datafile_text: &str) -> splitstream::Result<()> {
//! let client = splitstream::Client::builder()
//!     .with_datafile(datafile_text)
//!     .build()?;
//!
//! let user = client.create_user_context(
//!     "user-1",
//!     [("age".to_owned(), 30.0.into())].into_iter().collect(),
//! );
//! let decision = user.decide("checkout_redesign", &[]);
//! if decision.enabled {
//!     // ship the new checkout
//! }
//! # client.close();
//! # Ok(())
//! # }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

pub mod bucketer;
pub mod cmab;
pub mod conditions;
pub mod config_manager;
pub mod config_store;
pub mod datafile;
pub mod decision;
pub mod events;
pub mod notifications;
pub mod segments;
pub mod user_profile;

mod attributes;
mod audience;
mod client;
mod error;
mod user_context;

pub use attributes::{
    AttributeValue, Attributes, BOT_FILTERING_ATTRIBUTE, BUCKETING_ID_ATTRIBUTE,
};
pub use client::{Client, ClientBuilder};
pub use decision::{DecideOption, Decision, DecisionSource};
pub use error::{Error, Result};
pub use user_context::UserContext;
