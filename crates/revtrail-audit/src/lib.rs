//! # revtrail-audit
//!
//! Versioned change history for audited entities.
//!
//! This crate provides functionality for:
//! - Recording every create, update and destroy of an audited entity as an
//!   [`AuditRecord`] with a per-entity version (1, 2, 3, ...)
//! - Capturing who made a change through a scoped, lazily resolved
//!   attribution context
//! - Reconstructing an entity as it was at any version
//! - Undoing a single recorded change against the live entity store
//!
//! ## Actions
//!
//! | Action | Diff contents | Undo |
//! |--------|---------------|------|
//! | `create` | every recorded attribute, old side `null` | delete the entity |
//! | `update` | changed attributes only | restore old values |
//! | `destroy` | every recorded attribute, new side `null` | recreate from old values |
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use revtrail_audit::{
//!     attribution, Attribution, AuditedRegistry, AuditedRepository, Auditor, EntityOptions,
//!     EntityRepository, MemoryRepository, MemoryStore,
//! };
//! use revtrail_core::{AuditConfig, Party};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = AuditedRegistry::new();
//! registry.register("User", EntityOptions::new().except(["password_digest"]));
//!
//! let auditor = Arc::new(Auditor::new(
//!     AuditConfig::default(),
//!     registry,
//!     Arc::new(MemoryStore::new()),
//! ));
//! let users = AuditedRepository::new(MemoryRepository::new(), Arc::clone(&auditor));
//!
//! // Changes made inside the scope are attributed to the admin.
//! let user = attribution::scope(Attribution::new().actor(Party::reference("Admin", 1)), async {
//!     let attributes = json!({"name": "John"}).as_object().cloned().unwrap_or_default();
//!     users.insert("User", attributes).await
//! })
//! .await?;
//!
//! let first = auditor.revision(&user, 1).await?;
//! assert_eq!(first.get("name"), Some(&json!("John")));
//! # Ok(())
//! # }
//! ```

pub mod attribution;
pub mod auditor;
pub mod codec;
pub mod entity;
pub mod error;
pub mod record;
pub mod registry;
pub mod revision;
pub mod storage;
pub mod undo;

pub use attribution::{
    current_attribution, with_attribution, Attribution, AttributionScope, AttributionSnapshot,
    AttributionStore,
};
pub use auditor::{AuditTransaction, Auditor, Mutation};
pub use codec::{diff_attributes, Attributes, Change, Changes, Decoded, DiffFormat};
pub use entity::{AuditedRepository, EntityRepository, MemoryRepository};
pub use error::AuditError;
pub use record::{AuditDraft, AuditDraftBuilder, AuditRecord};
pub use registry::{AuditedRegistry, EntityOptions};
pub use revision::{reconstruct, reconstruct_all, reconstruct_at, Revision};
pub use storage::{create_store, AuditFilter, AuditStore, FileStore, MemoryStore};
pub use undo::{undo, UndoOutcome};
