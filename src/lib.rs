#![deny(clippy::all)]

pub mod aggregate;
pub mod anonymize;
pub mod output;
pub mod pipeline;
pub mod policy;
pub mod registry;
pub mod session;
pub mod utils;

pub use anonymize::{AnonymizeReport, Anonymizer};
pub use policy::AnonymizationPolicy;
pub use registry::IdentityRegistry;
pub use session::Session;
