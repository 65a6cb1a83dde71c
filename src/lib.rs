//! Promulgate - transactional entity-change publishing
//!
//! Every mutation of a domain entity produces exactly one durable event
//! envelope, delivered to every configured message broker, even across process
//! crashes. Concurrent mutations of the same entity are serialized by
//! per-entity distributed locks; a lock abandoned by a crashed holder is
//! recovered by the next acquirer, which republishes the lost change.

pub mod bus;
pub mod config;
pub mod entity;
pub mod lock;
pub mod payload;
pub mod publisher;
pub mod recovery;
pub mod utils;

pub use entity::{Attribution, EntityKey, EntityRef, EntityRegistry, EntityStore, Operation, OperationKind};
pub use publisher::{PublishMode, Transaction, TransactionError, TransactionalPublisher};
