// SPDX-License-Identifier: Apache-2.0

//! Descriptor broker: a single auxiliary process that redistributes file
//! descriptors among job participants over a local stream socket (§4.1).

mod address;
mod client;
mod cmsg;
mod connection;
mod daemon;
mod directory;
mod error;
mod wire;

pub use client::Client;
pub use daemon::Daemon;
pub use error::{BrokerError, Result};
pub use wire::{Record, RecordType};
