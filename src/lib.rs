//! Converts pickled digit-classifier models and a trained PCA transform
//! into plain JSON documents.
//!
//! ```text
//!  model/rfc.pkl ─────────┐                     ┌──▶ model/rfc.json
//!                         ├─▶ pickle ─▶ data ─▶ export
//!  model/trained_pca.pkl ─┘                     └──▶ model/trained_pca.json
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod export;
pub mod pickle;
pub mod value;

pub use error::ExportError;
