//! Drives interactive SSH shells across a fleet of hosts: bootstraps each
//! shell to a known prompt, runs deployment commands strictly in order per
//! host, and stops started components newest first.

#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod engine;
