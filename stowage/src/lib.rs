//! The stowage metrics aggregation daemon.
//!
//! Stowage accepts discrete counter, gauge and timer measurements over an
//! unreliable transport, accumulates them in memory and periodically reduces
//! them into statistical summaries at multiple time resolutions, persisting
//! each resolution to a backing time-series store. The pieces:
//!
//! * [`handler`] -- the per-type handlers and the shared two-phase
//!   aggregation pipeline they compose;
//! * [`receiver`] -- the UDP listener parsing wire lines into measurements;
//! * [`config`] -- daemon configuration, including the retention schedule;
//! * [`signals`] -- the shutdown signal plumbing.
//!
//! Work fans out onto the worker pool from the `stowage-pool` crate and
//! lands in a store from the `stowage-store` crate.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod handler;
pub mod receiver;
pub mod signals;
