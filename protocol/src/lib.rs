//! API types shared by the celgate policy engine and its callers.
//!
//! Everything here is plain serde data: admission requests, object metadata,
//! label selectors, the four CEL policy kinds and policy exceptions.

pub mod admission;
pub mod meta;
pub mod policy;

pub use admission::*;
pub use meta::*;
pub use policy::*;
