//! Battle detection over a stream of killmails.
//!
//! The pipeline runs in four stages: an [`ActivityScanner`] sweeps fixed
//! strides for dense locations, a [`SegmentRefiner`] narrows each candidate
//! to a precise interval, [`compile`] folds its killmails into a [`Battle`],
//! and the [`MergeEngine`] stores it without duplicates. [`Detector`] drives
//! the whole thing over a time range.
//!
//! This crate holds no database code. Storage sits behind the traits in
//! [`store`].
//!
//! [`ActivityScanner`]: scanner::ActivityScanner
//! [`SegmentRefiner`]: refiner::SegmentRefiner
//! [`compile`]: compiler::compile
//! [`Battle`]: battle::Battle
//! [`MergeEngine`]: merge::MergeEngine
//! [`Detector`]: detector::Detector

// Store traits return `impl Future + Send` explicitly; implementors use
// plain `async fn`.
#![allow(async_fn_in_trait)]

pub mod battle;
pub mod cache;
pub mod compiler;
pub mod config;
pub mod detector;
pub mod error;
pub mod interval;
pub mod killmail;
pub mod merge;
pub mod refiner;
pub mod scanner;
pub mod store;
pub mod teams;

pub use error::{Error, Result};

#[cfg(test)]
mod fixtures;
