//! # MongoDB deployment adoption tool
//!
//! This crate implements the core of mup: discovering already-running
//! MongoDB processes on local or ssh-reachable hosts, adopting them into
//! a uniform supervised on-disk layout (data files stay in place behind
//! symlinks), taking over the host's systemd units, and deriving the
//! exporter fleet plus scrape configuration that makes the adopted
//! cluster observable.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]

pub mod dbconfig;
pub mod discovery;
pub mod exec;
pub mod exporters;
pub mod import;
pub mod initsystem;
pub mod layout;
pub mod metastore;
pub mod replset;
pub mod supervisor;
pub mod sysunit;
pub mod topology;

#[cfg(test)]
pub(crate) mod testutil;
