// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! FAIR data pipeline command-line client.
//!
//! FAIR manages a local working copy of tracked data and code, kept in sync
//! with a metadata __registry__. Two parts carry the weight:
//!
//! 1. The [glob resolver](resolve), which expands wildcard entries of a user
//!    config into concrete entries by querying a registry.
//! 2. The [local registry manager](registry::server), which installs, runs,
//!    health checks and stops a registry server on the user's machine.
//!
//! Both are reached through a [`Session`], the context of one invocation.
//! Failures roll up into [`Error`], which tells the command line how severe
//! they are.

pub mod config;
pub mod error;
pub mod history;
pub mod path;
pub mod registry;
pub mod resolve;
pub mod session;
pub mod staging;

pub use error::{Error, ErrorKind, Result, Severity};
pub use session::Session;
