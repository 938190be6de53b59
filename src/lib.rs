//! Generation and maintenance of DICOM Modality Worklist entries.
//!
//! Worklist datasets are produced by site-specific rules written in Lua and
//! stored as files in a directory polled by the imaging devices. See
//! [`worklist::Worklist`] for the entry point.

pub mod codec;
pub mod config;
pub mod dataset;
pub mod dictionary;
pub mod engine;
pub mod error;
pub mod rules;
pub mod script;
pub mod store;
pub mod types;
pub mod watcher;
pub mod worklist;

pub use dataset::Dataset;
pub use error::{MultiError, Partial};
pub use types::{Customer, Patient};
pub use worklist::{Worklist, WorklistError, WorklistOptions};
