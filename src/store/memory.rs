use crate::{models, Error, Result};
use crate::schema::DocumentStatus;
use super::{Store, Tx};

#[derive(Clone, Default, PartialEq)]
struct Tables {
    templates: Vec<models::Template>,
    template_signers: Vec<models::TemplateSigner>,
    template_fields: Vec<models::TemplateField>,
    documents: Vec<models::Document>,
    document_signers: Vec<models::DocumentSigner>,
    form_submissions: Vec<models::FormSubmission>,
    digital_signatures: Vec<models::DigitalSignature>,
    document_audit_log: Vec<models::AuditLogEntry>,
}

#[cfg(test)]
#[derive(Default)]
struct Faults {
    fail_next_commit: bool,
    fail_audit_writes: bool,
}

/// In-process store with the same constraint and rollback behaviour as the
/// database. Transactions are serialized: each one works on a copy of the
/// tables that replaces the original only when the closure succeeds.
#[derive(Default)]
pub struct MemoryStore {
    tables: std::sync::Mutex<Tables>,
    #[cfg(test)]
    faults: std::sync::Mutex<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next transaction that writes anything fail at commit.
    #[cfg(test)]
    pub(crate) fn fail_next_commit(&self) {
        self.faults.lock().unwrap().fail_next_commit = true;
    }

    #[cfg(test)]
    pub(crate) fn audit_log(&self) -> Vec<models::AuditLogEntry> {
        self.tables.lock().unwrap().document_audit_log.clone()
    }

    #[cfg(test)]
    pub(crate) fn fail_audit_writes(&self, fail: bool) {
        self.faults.lock().unwrap().fail_audit_writes = fail;
    }
}

impl Store for MemoryStore {
    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn Tx) -> Result<T>,
    {
        let mut tables = self.tables.lock()
            .map_err(|_| Error::Persistence("memory store poisoned".to_string()))?;

        let mut tx = MemTx {
            tables: tables.clone(),
            #[cfg(test)]
            fail_audit_writes: self.faults.lock().map(|f| f.fail_audit_writes).unwrap_or(false),
        };
        let out = f(&mut tx)?;

        #[cfg(test)]
        {
            let mut faults = self.faults.lock().unwrap();
            if faults.fail_next_commit && tx.tables != *tables {
                faults.fail_next_commit = false;
                return Err(Error::Persistence("injected commit failure".to_string()));
            }
        }

        *tables = tx.tables;
        Ok(out)
    }
}

struct MemTx {
    tables: Tables,
    #[cfg(test)]
    fail_audit_writes: bool,
}

fn unique_violation(constraint: &str) -> Error {
    Error::Conflict(format!("duplicate value violates {}", constraint))
}

fn fk_violation(constraint: &str) -> Error {
    Error::Conflict(format!("reference violates {}", constraint))
}

impl Tx for MemTx {
    fn insert_template(&mut self, template: &models::Template) -> Result<()> {
        if self.tables.templates.iter().any(|t| t.id == template.id) {
            return Err(unique_violation("templates_pkey"));
        }
        self.tables.templates.push(template.clone());
        Ok(())
    }

    fn template(&mut self, id: uuid::Uuid) -> Result<Option<models::Template>> {
        Ok(self.tables.templates.iter().find(|t| t.id == id).cloned())
    }

    fn update_template(&mut self, template: &models::Template) -> Result<()> {
        if let Some(t) = self.tables.templates.iter_mut().find(|t| t.id == template.id) {
            *t = template.clone();
        }
        Ok(())
    }

    fn active_templates(&mut self, workspace_id: uuid::Uuid) -> Result<Vec<models::Template>> {
        let mut out = self.tables.templates.iter()
            .filter(|t| t.workspace_id == workspace_id && t.is_active)
            .cloned()
            .collect::<Vec<_>>();
        out.reverse();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    fn insert_template_signers(&mut self, signers: &[models::TemplateSigner]) -> Result<()> {
        for s in signers {
            if !self.tables.templates.iter().any(|t| t.id == s.template_id) {
                return Err(fk_violation("template_signers_template_id_fkey"));
            }
            if self.tables.template_signers.iter().any(|o| o.id == s.id) {
                return Err(unique_violation("template_signers_pkey"));
            }
            if self.tables.template_signers.iter().any(|o| o.template_id == s.template_id && o.signer_order == s.signer_order) {
                return Err(unique_violation("template_signers_template_id_signer_order_key"));
            }
            self.tables.template_signers.push(s.clone());
        }
        Ok(())
    }

    fn template_signers(&mut self, template_id: uuid::Uuid) -> Result<Vec<models::TemplateSigner>> {
        let mut out = self.tables.template_signers.iter()
            .filter(|s| s.template_id == template_id)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|s| s.signer_order);
        Ok(out)
    }

    fn delete_template_signers(&mut self, template_id: uuid::Uuid) -> Result<usize> {
        let doomed = self.tables.template_signers.iter()
            .filter(|s| s.template_id == template_id)
            .map(|s| s.id)
            .collect::<Vec<_>>();
        if self.tables.template_fields.iter().any(|f| doomed.contains(&f.signer_id)) {
            return Err(fk_violation("template_fields_signer_fkey"));
        }
        self.tables.template_signers.retain(|s| s.template_id != template_id);
        Ok(doomed.len())
    }

    fn insert_template_fields(&mut self, fields: &[models::TemplateField]) -> Result<()> {
        for f in fields {
            if !self.tables.template_signers.iter().any(|s| s.id == f.signer_id && s.template_id == f.template_id) {
                return Err(fk_violation("template_fields_signer_fkey"));
            }
            if self.tables.template_fields.iter().any(|o| o.id == f.id) {
                return Err(unique_violation("template_fields_pkey"));
            }
            if self.tables.template_fields.iter().any(|o| o.template_id == f.template_id && o.field_name == f.field_name) {
                return Err(unique_violation("template_fields_template_id_field_name_key"));
            }
            self.tables.template_fields.push(f.clone());
        }
        Ok(())
    }

    fn template_fields(&mut self, template_id: uuid::Uuid) -> Result<Vec<models::TemplateField>> {
        Ok(self.tables.template_fields.iter()
            .filter(|f| f.template_id == template_id)
            .cloned()
            .collect())
    }

    fn delete_template_fields(&mut self, template_id: uuid::Uuid) -> Result<usize> {
        let before = self.tables.template_fields.len();
        self.tables.template_fields.retain(|f| f.template_id != template_id);
        Ok(before - self.tables.template_fields.len())
    }

    fn insert_document(&mut self, document: &models::Document) -> Result<()> {
        if !self.tables.templates.iter().any(|t| t.id == document.template_id) {
            return Err(fk_violation("documents_template_id_fkey"));
        }
        if self.tables.documents.iter().any(|d| d.id == document.id) {
            return Err(unique_violation("documents_pkey"));
        }
        self.tables.documents.push(document.clone());
        Ok(())
    }

    fn document(&mut self, id: uuid::Uuid) -> Result<Option<models::Document>> {
        Ok(self.tables.documents.iter().find(|d| d.id == id).cloned())
    }

    fn lock_document(&mut self, id: uuid::Uuid) -> Result<Option<models::Document>> {
        self.document(id)
    }

    fn update_document(&mut self, document: &models::Document, expected: DocumentStatus) -> Result<bool> {
        match self.tables.documents.iter_mut().find(|d| d.id == document.id && d.status == expected) {
            Some(d) => {
                *d = document.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn overdue_documents(&mut self, now: chrono::NaiveDateTime) -> Result<Vec<models::Document>> {
        let mut out = self.tables.documents.iter()
            .filter(|d| d.is_overdue(now))
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|d| d.expires_at);
        Ok(out)
    }

    fn insert_document_signers(&mut self, signers: &[models::DocumentSigner]) -> Result<()> {
        for s in signers {
            if !self.tables.documents.iter().any(|d| d.id == s.document_id) {
                return Err(fk_violation("document_signers_document_id_fkey"));
            }
            let existing = &self.tables.document_signers;
            if existing.iter().any(|o| o.id == s.id) {
                return Err(unique_violation("document_signers_pkey"));
            }
            if existing.iter().any(|o| o.document_id == s.document_id && o.signer_order == s.signer_order) {
                return Err(unique_violation("document_signers_document_id_signer_order_key"));
            }
            if existing.iter().any(|o| o.document_id == s.document_id && o.signer_email == s.signer_email) {
                return Err(unique_violation("document_signers_document_id_signer_email_key"));
            }
            if existing.iter().any(|o| o.access_token == s.access_token) {
                return Err(unique_violation("document_signers_access_token_key"));
            }
            self.tables.document_signers.push(s.clone());
        }
        Ok(())
    }

    fn document_signers(&mut self, document_id: uuid::Uuid) -> Result<Vec<models::DocumentSigner>> {
        let mut out = self.tables.document_signers.iter()
            .filter(|s| s.document_id == document_id)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|s| s.signer_order);
        Ok(out)
    }

    fn document_signer(&mut self, id: uuid::Uuid) -> Result<Option<models::DocumentSigner>> {
        Ok(self.tables.document_signers.iter().find(|s| s.id == id).cloned())
    }

    fn document_signer_by_token(&mut self, token: &str) -> Result<Option<models::DocumentSigner>> {
        Ok(self.tables.document_signers.iter().find(|s| s.access_token == token).cloned())
    }

    fn update_document_signer(&mut self, signer: &models::DocumentSigner) -> Result<()> {
        if self.tables.document_signers.iter()
            .any(|o| o.id != signer.id && o.access_token == signer.access_token)
        {
            return Err(unique_violation("document_signers_access_token_key"));
        }
        if let Some(s) = self.tables.document_signers.iter_mut().find(|s| s.id == signer.id) {
            *s = signer.clone();
        }
        Ok(())
    }

    fn upsert_submission(&mut self, submission: &models::FormSubmission) -> Result<()> {
        if !self.tables.document_signers.iter()
            .any(|s| s.id == submission.document_signer_id && s.document_id == submission.document_id)
        {
            return Err(fk_violation("form_submissions_document_signer_id_fkey"));
        }
        match self.tables.form_submissions.iter_mut().find(|o| {
            o.document_id == submission.document_id
                && o.document_signer_id == submission.document_signer_id
                && o.field_id == submission.field_id
        }) {
            Some(existing) => {
                existing.encrypted_value = submission.encrypted_value.clone();
                existing.encryption_key_id = submission.encryption_key_id.clone();
                existing.submitted_at = submission.submitted_at;
                existing.ip_address = submission.ip_address;
                existing.user_agent = submission.user_agent.clone();
            }
            None => self.tables.form_submissions.push(submission.clone()),
        }
        Ok(())
    }

    fn submissions(&mut self, document_id: uuid::Uuid) -> Result<Vec<models::FormSubmission>> {
        Ok(self.tables.form_submissions.iter()
            .filter(|s| s.document_id == document_id)
            .cloned()
            .collect())
    }

    fn insert_signature(&mut self, signature: &models::DigitalSignature) -> Result<()> {
        if self.tables.digital_signatures.iter().any(|o| {
            o.document_id == signature.document_id && o.document_signer_id == signature.document_signer_id
        }) {
            return Err(unique_violation("digital_signatures_document_id_document_signer_id_key"));
        }
        self.tables.digital_signatures.push(signature.clone());
        Ok(())
    }

    fn signatures(&mut self, document_id: uuid::Uuid) -> Result<Vec<models::DigitalSignature>> {
        Ok(self.tables.digital_signatures.iter()
            .filter(|s| s.document_id == document_id)
            .cloned()
            .collect())
    }

    fn set_final_document_hash(&mut self, document_id: uuid::Uuid, hash: &str) -> Result<usize> {
        let mut n = 0;
        for s in self.tables.digital_signatures.iter_mut().filter(|s| s.document_id == document_id) {
            s.final_document_hash = Some(hash.to_string());
            n += 1;
        }
        Ok(n)
    }

    fn insert_audit_entry(&mut self, entry: &models::AuditLogEntry) -> Result<()> {
        #[cfg(test)]
        {
            if self.fail_audit_writes {
                return Err(Error::Persistence("injected audit failure".to_string()));
            }
        }
        self.tables.document_audit_log.push(entry.clone());
        Ok(())
    }

    fn audit_entries(&mut self, document_id: uuid::Uuid) -> Result<Vec<models::AuditLogEntry>> {
        Ok(self.tables.document_audit_log.iter()
            .filter(|e| e.document_id == Some(document_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(id: u128) -> models::Template {
        let now = chrono::Utc::now().naive_utc();
        models::Template {
            id: uuid::Uuid::from_u128(id),
            name: "NDA".to_string(),
            description: String::new(),
            s3_bucket: "esign".to_string(),
            s3_key: "templates/nda.pdf".to_string(),
            pdf_hash: String::new(),
            file_size: 0,
            mime_type: "application/pdf".to_string(),
            total_pages: 1,
            created_by: 1,
            workspace_id: uuid::Uuid::from_u128(100),
            is_active: true,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    fn signer(id: u128, order: i32) -> models::TemplateSigner {
        models::TemplateSigner {
            id: uuid::Uuid::from_u128(id),
            template_id: uuid::Uuid::from_u128(1),
            signer_order: order,
            signer_name: format!("Signer {}", order),
            signer_color: "#3366ff".to_string(),
            created_at: chrono::Utc::now().naive_utc(),
        }
    }

    #[test]
    fn failed_closure_rolls_back() {
        let store = MemoryStore::new();
        let res: Result<()> = store.transaction(|tx| {
            tx.insert_template(&template(1))?;
            Err(Error::Conflict("abort".to_string()))
        });
        assert!(res.is_err());
        assert!(store.transaction(|tx| tx.template(uuid::Uuid::from_u128(1))).unwrap().is_none());
    }

    #[test]
    fn enforces_signer_order_uniqueness() {
        let store = MemoryStore::new();
        let res = store.transaction(|tx| {
            tx.insert_template(&template(1))?;
            tx.insert_template_signers(&[signer(10, 1), signer(11, 1)])
        });
        assert!(matches!(res, Err(Error::Conflict(_))));
        assert!(store.transaction(|tx| tx.template(uuid::Uuid::from_u128(1))).unwrap().is_none());
    }

    #[test]
    fn injected_commit_failure_discards_writes() {
        let store = MemoryStore::new();
        store.fail_next_commit();
        assert!(store.transaction(|tx| tx.insert_template(&template(1))).is_err());
        store.transaction(|tx| tx.insert_template(&template(1))).unwrap();
        assert!(store.transaction(|tx| tx.template(uuid::Uuid::from_u128(1))).unwrap().is_some());
    }

    fn field(id: u128, template_id: u128, signer_id: u128) -> models::TemplateField {
        models::TemplateField {
            id: uuid::Uuid::from_u128(id),
            template_id: uuid::Uuid::from_u128(template_id),
            signer_id: uuid::Uuid::from_u128(signer_id),
            field_name: "name".to_string(),
            field_type: crate::schema::FieldType::Text,
            field_label: "Name".to_string(),
            placeholder_text: String::new(),
            page: 1,
            x: 0.1,
            y: 0.1,
            width: 0.2,
            height: 0.05,
            validation_rules: serde_json::json!({}),
            required: true,
            version: 1,
            created_at: chrono::Utc::now().naive_utc(),
        }
    }

    #[test]
    fn field_signer_must_belong_to_same_template() {
        let store = MemoryStore::new();
        store.transaction(|tx| {
            tx.insert_template(&template(1))?;
            tx.insert_template(&template(2))?;
            tx.insert_template_signers(&[signer(10, 1)])?;
            tx.insert_template_signers(&[models::TemplateSigner {
                template_id: uuid::Uuid::from_u128(2),
                ..signer(11, 1)
            }])
        }).unwrap();

        let res = store.transaction(|tx| tx.insert_template_fields(&[field(20, 1, 11)]));
        assert!(matches!(res, Err(Error::Conflict(_))));
        store.transaction(|tx| tx.insert_template_fields(&[field(20, 1, 10)])).unwrap();
    }

    #[test]
    fn signers_with_fields_cannot_be_deleted() {
        let store = MemoryStore::new();
        store.transaction(|tx| {
            tx.insert_template(&template(1))?;
            tx.insert_template_signers(&[signer(10, 1)])?;
            tx.insert_template_fields(&[field(20, 1, 10)])
        }).unwrap();

        let res = store.transaction(|tx| tx.delete_template_signers(uuid::Uuid::from_u128(1)));
        assert!(matches!(res, Err(Error::Conflict(_))));

        let removed = store.transaction(|tx| {
            tx.delete_template_fields(uuid::Uuid::from_u128(1))?;
            tx.delete_template_signers(uuid::Uuid::from_u128(1))
        }).unwrap();
        assert_eq!(removed, 1);
    }
}
