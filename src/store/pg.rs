use diesel::prelude::*;
use crate::{models, schema, Result};
use crate::schema::DocumentStatus;
use super::{Store, Tx};

pub type DbPool = r2d2::Pool<diesel::r2d2::ConnectionManager<diesel::PgConnection>>;

embed_migrations!("./migrations");

#[derive(Clone)]
pub struct PgStore {
    pool: std::sync::Arc<DbPool>,
}

impl PgStore {
    pub fn connect(database_url: &str, pool_size: u32) -> Result<Self> {
        let manager = diesel::r2d2::ConnectionManager::<diesel::PgConnection>::new(database_url);
        let pool = r2d2::Pool::builder().max_size(pool_size).build(manager)?;
        Ok(Self::new(pool))
    }

    pub fn new(pool: DbPool) -> Self {
        PgStore {
            pool: std::sync::Arc::new(pool),
        }
    }

    pub fn run_migrations(&self) -> Result<()> {
        let c = self.pool.get()?;
        embedded_migrations::run_with_output(&c, &mut std::io::stdout())
            .map_err(|err| crate::Error::Persistence(format!("Unable to run migrations: {}", err)))
    }
}

impl Store for PgStore {
    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn Tx) -> Result<T>,
    {
        let c = self.pool.get()?;
        c.transaction(|| {
            let mut tx = PgTx { c: &c };
            f(&mut tx)
        })
    }
}

struct PgTx<'a> {
    c: &'a diesel::PgConnection,
}

impl Tx for PgTx<'_> {
    fn insert_template(&mut self, template: &models::Template) -> Result<()> {
        diesel::insert_into(schema::templates::dsl::templates)
            .values(template)
            .execute(self.c)?;
        Ok(())
    }

    fn template(&mut self, id: uuid::Uuid) -> Result<Option<models::Template>> {
        Ok(schema::templates::dsl::templates.find(id).first::<models::Template>(self.c).optional()?)
    }

    fn update_template(&mut self, template: &models::Template) -> Result<()> {
        diesel::update(schema::templates::dsl::templates.find(template.id))
            .set(template)
            .execute(self.c)?;
        Ok(())
    }

    fn active_templates(&mut self, workspace_id: uuid::Uuid) -> Result<Vec<models::Template>> {
        Ok(schema::templates::dsl::templates
            .filter(schema::templates::dsl::workspace_id.eq(workspace_id))
            .filter(schema::templates::dsl::is_active.eq(true))
            .order(schema::templates::dsl::created_at.desc())
            .load::<models::Template>(self.c)?)
    }

    fn insert_template_signers(&mut self, signers: &[models::TemplateSigner]) -> Result<()> {
        diesel::insert_into(schema::template_signers::dsl::template_signers)
            .values(signers)
            .execute(self.c)?;
        Ok(())
    }

    fn template_signers(&mut self, template_id: uuid::Uuid) -> Result<Vec<models::TemplateSigner>> {
        Ok(schema::template_signers::dsl::template_signers
            .filter(schema::template_signers::dsl::template_id.eq(template_id))
            .order(schema::template_signers::dsl::signer_order.asc())
            .load::<models::TemplateSigner>(self.c)?)
    }

    fn delete_template_signers(&mut self, template_id: uuid::Uuid) -> Result<usize> {
        Ok(diesel::delete(schema::template_signers::dsl::template_signers
            .filter(schema::template_signers::dsl::template_id.eq(template_id))
        ).execute(self.c)?)
    }

    fn insert_template_fields(&mut self, fields: &[models::TemplateField]) -> Result<()> {
        diesel::insert_into(schema::template_fields::dsl::template_fields)
            .values(fields)
            .execute(self.c)?;
        Ok(())
    }

    fn template_fields(&mut self, template_id: uuid::Uuid) -> Result<Vec<models::TemplateField>> {
        Ok(schema::template_fields::dsl::template_fields
            .filter(schema::template_fields::dsl::template_id.eq(template_id))
            .order((schema::template_fields::dsl::created_at.asc(), schema::template_fields::dsl::field_name.asc()))
            .load::<models::TemplateField>(self.c)?)
    }

    fn delete_template_fields(&mut self, template_id: uuid::Uuid) -> Result<usize> {
        Ok(diesel::delete(schema::template_fields::dsl::template_fields
            .filter(schema::template_fields::dsl::template_id.eq(template_id))
        ).execute(self.c)?)
    }

    fn insert_document(&mut self, document: &models::Document) -> Result<()> {
        diesel::insert_into(schema::documents::dsl::documents)
            .values(document)
            .execute(self.c)?;
        Ok(())
    }

    fn document(&mut self, id: uuid::Uuid) -> Result<Option<models::Document>> {
        Ok(schema::documents::dsl::documents.find(id).first::<models::Document>(self.c).optional()?)
    }

    fn lock_document(&mut self, id: uuid::Uuid) -> Result<Option<models::Document>> {
        Ok(schema::documents::dsl::documents.find(id)
            .for_update()
            .first::<models::Document>(self.c).optional()?)
    }

    fn update_document(&mut self, document: &models::Document, expected: DocumentStatus) -> Result<bool> {
        let rows = diesel::update(schema::documents::dsl::documents
            .filter(schema::documents::dsl::id.eq(document.id))
            .filter(schema::documents::dsl::status.eq(expected))
        )
            .set(document)
            .execute(self.c)?;
        Ok(rows == 1)
    }

    fn overdue_documents(&mut self, now: chrono::NaiveDateTime) -> Result<Vec<models::Document>> {
        Ok(schema::documents::dsl::documents
            .filter(schema::documents::dsl::expires_at.le(now))
            .filter(schema::documents::dsl::status.eq_any(vec![
                DocumentStatus::Draft, DocumentStatus::Scheduled, DocumentStatus::Sent, DocumentStatus::InProgress,
            ]))
            .order(schema::documents::dsl::expires_at.asc())
            .load::<models::Document>(self.c)?)
    }

    fn insert_document_signers(&mut self, signers: &[models::DocumentSigner]) -> Result<()> {
        diesel::insert_into(schema::document_signers::dsl::document_signers)
            .values(signers)
            .execute(self.c)?;
        Ok(())
    }

    fn document_signers(&mut self, document_id: uuid::Uuid) -> Result<Vec<models::DocumentSigner>> {
        Ok(schema::document_signers::dsl::document_signers
            .filter(schema::document_signers::dsl::document_id.eq(document_id))
            .order(schema::document_signers::dsl::signer_order.asc())
            .load::<models::DocumentSigner>(self.c)?)
    }

    fn document_signer(&mut self, id: uuid::Uuid) -> Result<Option<models::DocumentSigner>> {
        Ok(schema::document_signers::dsl::document_signers.find(id)
            .first::<models::DocumentSigner>(self.c).optional()?)
    }

    fn document_signer_by_token(&mut self, token: &str) -> Result<Option<models::DocumentSigner>> {
        Ok(schema::document_signers::dsl::document_signers
            .filter(schema::document_signers::dsl::access_token.eq(token))
            .first::<models::DocumentSigner>(self.c).optional()?)
    }

    fn update_document_signer(&mut self, signer: &models::DocumentSigner) -> Result<()> {
        diesel::update(schema::document_signers::dsl::document_signers.find(signer.id))
            .set(signer)
            .execute(self.c)?;
        Ok(())
    }

    fn upsert_submission(&mut self, submission: &models::FormSubmission) -> Result<()> {
        diesel::insert_into(schema::form_submissions::dsl::form_submissions)
            .values(submission)
            .on_conflict((
                schema::form_submissions::dsl::document_id,
                schema::form_submissions::dsl::document_signer_id,
                schema::form_submissions::dsl::field_id,
            ))
            .do_update()
            .set((
                schema::form_submissions::dsl::encrypted_value.eq(&submission.encrypted_value),
                schema::form_submissions::dsl::encryption_key_id.eq(&submission.encryption_key_id),
                schema::form_submissions::dsl::submitted_at.eq(submission.submitted_at),
                schema::form_submissions::dsl::ip_address.eq(submission.ip_address),
                schema::form_submissions::dsl::user_agent.eq(&submission.user_agent),
            ))
            .execute(self.c)?;
        Ok(())
    }

    fn submissions(&mut self, document_id: uuid::Uuid) -> Result<Vec<models::FormSubmission>> {
        Ok(schema::form_submissions::dsl::form_submissions
            .filter(schema::form_submissions::dsl::document_id.eq(document_id))
            .order(schema::form_submissions::dsl::submitted_at.asc())
            .load::<models::FormSubmission>(self.c)?)
    }

    fn insert_signature(&mut self, signature: &models::DigitalSignature) -> Result<()> {
        diesel::insert_into(schema::digital_signatures::dsl::digital_signatures)
            .values(signature)
            .execute(self.c)?;
        Ok(())
    }

    fn signatures(&mut self, document_id: uuid::Uuid) -> Result<Vec<models::DigitalSignature>> {
        Ok(schema::digital_signatures::dsl::digital_signatures
            .filter(schema::digital_signatures::dsl::document_id.eq(document_id))
            .order(schema::digital_signatures::dsl::signed_at.asc())
            .load::<models::DigitalSignature>(self.c)?)
    }

    fn set_final_document_hash(&mut self, document_id: uuid::Uuid, hash: &str) -> Result<usize> {
        Ok(diesel::update(schema::digital_signatures::dsl::digital_signatures
            .filter(schema::digital_signatures::dsl::document_id.eq(document_id))
        )
            .set(schema::digital_signatures::dsl::final_document_hash.eq(hash))
            .execute(self.c)?)
    }

    fn insert_audit_entry(&mut self, entry: &models::AuditLogEntry) -> Result<()> {
        diesel::insert_into(schema::document_audit_log::dsl::document_audit_log)
            .values(entry)
            .execute(self.c)?;
        Ok(())
    }

    fn audit_entries(&mut self, document_id: uuid::Uuid) -> Result<Vec<models::AuditLogEntry>> {
        Ok(schema::document_audit_log::dsl::document_audit_log
            .filter(schema::document_audit_log::dsl::document_id.eq(document_id))
            .order(schema::document_audit_log::dsl::created_at.asc())
            .load::<models::AuditLogEntry>(self.c)?)
    }
}
