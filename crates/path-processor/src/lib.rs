#![forbid(unsafe_code)]
#![allow(clippy::too_many_arguments)]

//! Coordination core of an IBC relayer.
//!
//! A [`PathProcessor`](processor::PathProcessor) owns a pair of path ends
//! and merges the observation streams two chain processors push at it.
//! Once both sides are in sync, it decides which IBC messages must be
//! submitted next, to which chain, with which proofs, in which order. It
//! drives those decisions to completion across retries and partial
//! failures, through the [`ChainProvider`](provider::ChainProvider)
//! implementations attached to each side.

pub mod cache;
pub mod error;
pub mod filter;
pub mod ident;
pub mod lifecycle;
pub mod msgs;
pub mod path;
pub mod processor;
pub mod provider;
pub mod runtime;
pub mod util;

mod resolve;
