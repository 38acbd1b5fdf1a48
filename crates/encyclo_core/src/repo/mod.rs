//! Store abstractions and SQLite implementations.
//!
//! # Responsibility
//! - Define the article, creation-lock and quota contracts the resolver
//!   depends on.
//! - Keep SQL details inside the persistence boundary.
//!
//! # Invariants
//! - Every shared-state mutation is a store-level atomic primitive
//!   (conditional upsert or immediate transaction), never an in-process mutex,
//!   since resolvers may run in separate processes.

pub mod article_repo;
pub mod lock_repo;
pub mod quota_repo;
