//! Data layer: model records, loading, and normalization.
//!
//! Architecture:
//! ```text
//!  .pkl / .json
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  loader   │  read artifact → Value → validated records
//!   └──────────┘
//!        │
//!        ▼
//!   ┌─────────────────────────────────────────────┐
//!   │ ClassifierModelCollection / ProjectionModel │  ArrayLike fields
//!   └─────────────────────────────────────────────┘
//!        │
//!        ▼
//!   ┌───────────┐
//!   │ normalize │  ArrayLike → Nested (JSON-ready)
//!   └───────────┘
//! ```

pub mod loader;
pub mod model;
pub mod normalize;
