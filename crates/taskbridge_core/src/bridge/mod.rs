//! Object bridge between the entity graph and the record store.
//!
//! # Responsibility
//! - Map domain entities to storage records and back ([`IdentityMap`]).
//! - Track pending work and give it commit/rollback semantics
//!   ([`UnitOfWork`]).
//! - Expose both, plus queries, through [`Session`].
//!
//! # See also
//! - `crate::notify` for how graph mutations reach the unit of work.

pub mod error;
pub mod identity_map;
pub mod query;
pub mod session;
pub mod unit_of_work;

pub use error::{BridgeError, BridgeResult};
pub use identity_map::IdentityMap;
pub use query::Paged;
pub use session::Session;
pub use unit_of_work::{TrackedCounts, UnitOfWork};
