//! Background live-query evaluation and change delivery.
//!
//! A [`LiveResults`] handle registered with the [`Coordinator`] gets a
//! [`LiveQuery`] driven through a three-phase cycle per commit: the worker
//! thread re-evaluates the query against a background snapshot and decides
//! whether anything changed (RUN), exports the new view as a
//! thread-transportable payload (HANDOVER), and the owning thread imports
//! it, installs it into the handle, and invokes observer callbacks with the
//! changeset describing the transition from the previously delivered view
//! (DELIVER + NOTIFY).
//!
//! Observers are token-identified callbacks that may be added and removed
//! from any thread, may declare link-column paths to watch for indirect
//! modifications, and are each invoked at most once per delivered view
//! version.

pub mod coordinator;
pub mod live_query;
pub mod results;

mod diff;
mod paths;

pub use coordinator::Coordinator;
pub use live_query::{LiveQuery, NotifyCallback};
pub use results::LiveResults;
