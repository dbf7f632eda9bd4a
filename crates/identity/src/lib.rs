//! Identity resolution — maps heterogeneous identifiers to one stable
//! Universal ID with an auditable derivation trace.

pub mod normalize;
pub mod resolver;

pub use normalize::{hash_email, normalize_phone, normalize_set};
pub use resolver::IdentityResolver;
