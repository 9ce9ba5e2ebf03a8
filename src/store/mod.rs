//! Persistence seam. Every multi-row mutation in the workflow runs inside one
//! [`Store::transaction`] call; an `Err` from the closure rolls everything
//! back.

use crate::models;
use crate::schema::DocumentStatus;
use crate::Result;

mod memory;
mod pg;

pub use memory::MemoryStore;
pub use pg::{PgStore, DbPool};

pub trait Store: Send + Sync {
    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn Tx) -> Result<T>;
}

/// Row-level operations available inside a transaction. Unique constraints
/// surface as `Error::Conflict`.
pub trait Tx {
    fn insert_template(&mut self, template: &models::Template) -> Result<()>;
    fn template(&mut self, id: uuid::Uuid) -> Result<Option<models::Template>>;
    fn update_template(&mut self, template: &models::Template) -> Result<()>;
    /// Active templates of a workspace, newest first.
    fn active_templates(&mut self, workspace_id: uuid::Uuid) -> Result<Vec<models::Template>>;

    fn insert_template_signers(&mut self, signers: &[models::TemplateSigner]) -> Result<()>;
    /// Ordered by signer order.
    fn template_signers(&mut self, template_id: uuid::Uuid) -> Result<Vec<models::TemplateSigner>>;
    fn delete_template_signers(&mut self, template_id: uuid::Uuid) -> Result<usize>;

    fn insert_template_fields(&mut self, fields: &[models::TemplateField]) -> Result<()>;
    /// Ordered by creation.
    fn template_fields(&mut self, template_id: uuid::Uuid) -> Result<Vec<models::TemplateField>>;
    fn delete_template_fields(&mut self, template_id: uuid::Uuid) -> Result<usize>;

    fn insert_document(&mut self, document: &models::Document) -> Result<()>;
    fn document(&mut self, id: uuid::Uuid) -> Result<Option<models::Document>>;
    /// Loads the document and holds its row lock until the transaction ends.
    fn lock_document(&mut self, id: uuid::Uuid) -> Result<Option<models::Document>>;
    /// Writes `document` only if the stored status still equals `expected`.
    fn update_document(&mut self, document: &models::Document, expected: DocumentStatus) -> Result<bool>;
    fn overdue_documents(&mut self, now: chrono::NaiveDateTime) -> Result<Vec<models::Document>>;

    fn insert_document_signers(&mut self, signers: &[models::DocumentSigner]) -> Result<()>;
    /// Ordered by signer order.
    fn document_signers(&mut self, document_id: uuid::Uuid) -> Result<Vec<models::DocumentSigner>>;
    fn document_signer(&mut self, id: uuid::Uuid) -> Result<Option<models::DocumentSigner>>;
    fn document_signer_by_token(&mut self, token: &str) -> Result<Option<models::DocumentSigner>>;
    fn update_document_signer(&mut self, signer: &models::DocumentSigner) -> Result<()>;

    /// Insert or overwrite the row keyed by (document, signer, field).
    fn upsert_submission(&mut self, submission: &models::FormSubmission) -> Result<()>;
    fn submissions(&mut self, document_id: uuid::Uuid) -> Result<Vec<models::FormSubmission>>;

    fn insert_signature(&mut self, signature: &models::DigitalSignature) -> Result<()>;
    fn signatures(&mut self, document_id: uuid::Uuid) -> Result<Vec<models::DigitalSignature>>;
    fn set_final_document_hash(&mut self, document_id: uuid::Uuid, hash: &str) -> Result<usize>;

    fn insert_audit_entry(&mut self, entry: &models::AuditLogEntry) -> Result<()>;
    /// Oldest first.
    fn audit_entries(&mut self, document_id: uuid::Uuid) -> Result<Vec<models::AuditLogEntry>>;
}
