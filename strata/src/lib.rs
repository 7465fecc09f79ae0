pub use strata_base as base;

pub use strata_api as api;

#[cfg(feature = "framework")]
pub use strata_framework as framework;
