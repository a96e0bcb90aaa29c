// crates/core/src/lib.rs
//! Hashtab registry, GCD hashtab cache and the qmldiff engine seam.

pub mod engine;
pub mod error;
pub mod gcd;
pub mod hashtab;
pub mod registry;

pub use engine::{HashEngine, QmldiffEngine};
pub use error::*;
pub use gcd::{GcdCache, GcdHashtab};
pub use hashtab::{Hashtab, HashtabFormat};
pub use registry::{SourceRegistry, VersionInfo};
