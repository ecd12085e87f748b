//! Process-isolated plugins
//!
//! Each plugin is an independently built executable started as a child
//! process. It proves it speaks our protocol with a one-line handshake on
//! stdout, then serves RPC calls over the socket it advertised.
//!
//! # Architecture
//!
//! - **Process Isolation**: a crashing plugin only takes its own routes down
//! - **Handshake first**: nothing is sent to a plugin before its version and cookie check out
//! - **Fail-fast**: a plugin whose channel broke answers 500 until the next reload
//!
//! # Modules
//!
//! - `source`: candidate enumeration (directory scan or configured entries)
//! - `process`: child process spawning, output forwarding and termination
//! - `descriptor`: the per-plugin record shared with route entries
//! - `launcher`: start/stop/tracking of admitted plugins

pub mod descriptor;
pub mod launcher;
pub mod process;
pub mod source;

pub use descriptor::{PluginDescriptor, PluginStatus, PluginSummary};
pub use launcher::{LaunchFailure, Launcher, LauncherOptions};
pub use process::{PluginProcess, PLUGIN_OUTPUT_TARGET};
pub use source::{PluginCandidate, PluginSource};
