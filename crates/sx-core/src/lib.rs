//! Core of `sx`: a content-addressed store and the garbage collector that
//! keeps it bounded while builders keep adding to it.

pub mod commands;
pub mod config;
pub mod fs;
pub mod gc;
pub mod lock;
mod outcome;
pub mod store;
pub mod store_path;

pub use config::{GcSettings, StoreConfig};
pub use gc::{
    AutoGcOutcome, GcAction, GcCoordinator, GcError, GcOptions, GcResults, Interrupt, Roots,
    TempRoots,
};
pub use outcome::{to_json_response, CommandStatus, ExecutionOutcome};
pub use store::{LocalStore, PathInfo, Store, StoreError};
pub use store_path::{StoreDir, StorePath};
