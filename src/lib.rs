//! ESPore is a development toolkit for NodeMCU-class microcontrollers that
//! run an interactive Lua interpreter over a serial line. It composes
//! deterministic, content-addressed firmware images from reusable script
//! libraries, drives the device's text REPL as a byte-stream protocol, and
//! offers an interactive terminal workspace for day-to-day device work.
//!
//! The crate is organized around three cooperating pieces:
//!
//! * The **builder** resolves a dependency graph of script modules and data
//!   files drawn from multiple libraries into a per-device image with a
//!   manifest and content hash, optionally compiling the scripts into a
//!   flash archive with the external cross-compiler.
//! * The **session** owns a serial byte stream and speaks the on-device
//!   helper protocol: it bootstraps the helper on demand, uploads files
//!   with flow control and checksum verification, and invokes remote
//!   procedures that return JSON replies. All request/response exchanges
//!   are serialized through a shared-reader lock.
//! * The **cli** multiplexes asynchronous device output, user commands with
//!   history and autocomplete, a live file browser and background file
//!   watchers over one terminal, funnelling every device interaction
//!   through the session.
//!
//! The initializer picks the right image for a device by chip ID and pushes
//! it, and the firmware server publishes built images over HTTP with
//! hash-derived ETags so devices can pull updates.

pub mod builder;
pub mod cli;
pub mod config;
pub mod error;
pub mod fwserver;
pub mod initializer;
pub mod session;
pub mod settings;
pub mod utils;

pub use config::{BuildConfig, EsporeConfig};
pub use error::{Error, Result};
pub use session::Session;
pub use settings::{Settings, SettingsBuilder};
