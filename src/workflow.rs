//! Document lifecycle: instantiation from a template, distribution,
//! recipient input, signing and completion.

use std::collections::{HashMap, HashSet};
use crate::auth::{authorize, Action, Principal, Resource};
use crate::audit::AuditEvent;
use crate::catalog::{load_template, MAX_NAME_LEN};
use crate::crypto::{access_token_is_valid, hash_hex, make_access_token};
use crate::models::{Position, ValidationRules};
use crate::schema::{AuditAction, DocumentStatus, FieldType, SignerStatus};
use crate::store::{Store, Tx};
use crate::{models, pdf, ClientMeta, Engine, Error, Result};

lazy_static! {
    static ref EMAIL_RE: regex::Regex = regex::Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
}

pub const MIN_PHONE_DIGITS: usize = 7;

/// What a document was instantiated from. The workflow only ever reads this,
/// never the live template.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub template_id: uuid::Uuid,
    pub template_version: i32,
    pub content: ContentRef,
    pub signers: Vec<SnapshotSigner>,
    pub fields: Vec<SnapshotField>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ContentRef {
    pub bucket: String,
    pub key: String,
    pub hash: String,
    pub size: i64,
    pub total_pages: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SnapshotSigner {
    pub id: uuid::Uuid,
    pub order: i32,
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SnapshotField {
    pub id: uuid::Uuid,
    pub signer_id: uuid::Uuid,
    pub name: String,
    pub field_type: FieldType,
    pub label: String,
    pub position: Position,
    pub rules: ValidationRules,
    pub required: bool,
}

impl Snapshot {
    fn capture(template: &models::Template, signers: &[models::TemplateSigner], fields: &[models::TemplateField]) -> Result<Self> {
        let mut fields = fields.iter().map(|f| Ok(SnapshotField {
            id: f.id,
            signer_id: f.signer_id,
            name: f.field_name.clone(),
            field_type: f.field_type,
            label: f.field_label.clone(),
            position: f.position(),
            rules: f.rules()?,
            required: f.required,
        })).collect::<Result<Vec<_>>>()?;
        fields.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Snapshot {
            template_id: template.id,
            template_version: template.version,
            content: ContentRef {
                bucket: template.s3_bucket.clone(),
                key: template.s3_key.clone(),
                hash: template.pdf_hash.clone(),
                size: template.file_size,
                total_pages: template.total_pages,
            },
            signers: signers.iter().map(|s| SnapshotSigner {
                id: s.id,
                order: s.signer_order,
                name: s.signer_name.clone(),
            }).collect(),
            fields,
        })
    }

    pub fn fields_for(&self, template_signer_id: uuid::Uuid) -> impl Iterator<Item = &SnapshotField> {
        self.fields.iter().filter(move |f| f.signer_id == template_signer_id)
    }
}

/// Hash over the canonical serialization of a stored snapshot.
pub fn snapshot_hash(snapshot: &serde_json::Value) -> Result<String> {
    let bytes = serde_json::to_vec(snapshot)
        .map_err(|err| Error::Persistence(format!("Unable to serialize snapshot: {}", err)))?;
    Ok(hash_hex(&bytes))
}

fn load_snapshot(document: &models::Document) -> Result<Snapshot> {
    if snapshot_hash(&document.template_snapshot)? != document.template_snapshot_hash {
        error!("Snapshot of document {} does not match its hash", document.id);
        return Err(Error::Integrity(format!("snapshot hash mismatch for document {}", document.id)));
    }
    serde_json::from_value(document.template_snapshot.clone())
        .map_err(|err| Error::Integrity(format!("unreadable snapshot for document {}: {}", document.id, err)))
}

#[derive(Deserialize, Clone, Debug)]
pub struct Recipient {
    pub signer_order: i32,
    pub email: String,
    pub name: String,
}

pub struct NewDocument {
    pub template_id: uuid::Uuid,
    pub name: String,
    pub recipients: Vec<Recipient>,
    pub expires_at: Option<chrono::NaiveDateTime>,
}

#[derive(Serialize, Clone, Debug)]
pub struct DocumentDetail {
    pub document: models::Document,
    pub signers: Vec<models::DocumentSigner>,
}

/// What a recipient sees after presenting their access token.
#[derive(Serialize, Clone, Debug)]
pub struct SignerSession {
    pub document: models::Document,
    pub signer: models::DocumentSigner,
    pub fields: Vec<SnapshotField>,
}

pub struct SignatureInput {
    pub signature: Vec<u8>,
    pub certificate: Option<String>,
    pub algorithm: String,
}

#[derive(Serialize, Clone, Debug)]
pub struct SignOutcome {
    pub signature: models::DigitalSignature,
    /// Set when this signature was the last one and the document is now
    /// completed.
    pub completed: bool,
}

#[derive(Serialize, Clone, Debug)]
pub struct DocumentLink {
    pub path: String,
    pub key: String,
}

/// Rejects input on anything but a distributed, open, unexpired document.
fn check_accepts_input(document: &models::Document, now: chrono::NaiveDateTime) -> Result<()> {
    if document.status.is_terminal() {
        return Err(Error::DocumentClosed(document.status));
    }
    if document.is_overdue(now) {
        return Err(Error::DocumentClosed(DocumentStatus::Expired));
    }
    if !document.status.accepts_input() {
        return Err(Error::Conflict(format!("document is {}, not yet sent", document.status)));
    }
    Ok(())
}

/// Like [`check_accepts_input`], but drafts and scheduled documents do not
/// exist as far as a recipient can tell.
fn check_recipient_access(document: &models::Document, now: chrono::NaiveDateTime) -> Result<()> {
    if !document.status.is_terminal() && !document.status.accepts_input() {
        return Err(Error::NotFound);
    }
    check_accepts_input(document, now)
}

fn set_status(tx: &mut dyn Tx, document: &mut models::Document, status: DocumentStatus, now: chrono::NaiveDateTime) -> Result<()> {
    let expected = document.status;
    document.status = status;
    document.updated_at = now;
    if !tx.update_document(document, expected)? {
        return Err(Error::Conflict(format!("document {} changed concurrently", document.id)));
    }
    Ok(())
}

fn owned(document: &models::Document) -> Resource {
    Resource::Owned {
        workspace_id: document.workspace_id,
        created_by: document.created_by,
    }
}

fn load_document(tx: &mut dyn Tx, principal: &Principal, id: uuid::Uuid, action: Action) -> Result<models::Document> {
    let document = tx.document(id)?.ok_or(Error::NotFound)?;
    authorize(principal, action, owned(&document))?;
    Ok(document)
}

fn lock_document(tx: &mut dyn Tx, id: uuid::Uuid) -> Result<models::Document> {
    tx.lock_document(id)?.ok_or(Error::NotFound)
}

/// Checks a submitted value against its field's type and rules. Empty values
/// clear optional fields.
pub fn validate_value(field: &SnapshotField, value: &str) -> Result<()> {
    let value = value.trim();
    if value.is_empty() {
        if field.required {
            return Err(Error::validation(&field.name, "is required"));
        }
        return Ok(());
    }

    match field.field_type {
        FieldType::Email if !EMAIL_RE.is_match(value) => {
            return Err(Error::validation(&field.name, "must be a valid email address"));
        }
        FieldType::Phone => {
            if !value.chars().all(|c| c.is_ascii_digit() || "+()- .".contains(c)) {
                return Err(Error::validation(&field.name, "must contain only digits and + ( ) - . characters"));
            }
            if value.chars().filter(|c| c.is_ascii_digit()).count() < MIN_PHONE_DIGITS {
                return Err(Error::validation(&field.name, format!("must contain at least {} digits", MIN_PHONE_DIGITS)));
            }
        }
        FieldType::Date if chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d").is_err() => {
            return Err(Error::validation(&field.name, "must be a date in YYYY-MM-DD format"));
        }
        FieldType::Checkbox => match value {
            "true" => {}
            "false" if field.required => return Err(Error::validation(&field.name, "must be checked")),
            "false" => {}
            _ => return Err(Error::validation(&field.name, "must be true or false")),
        },
        _ => {}
    }

    let len = value.chars().count();
    if let Some(min) = field.rules.min_length {
        if len < min {
            return Err(Error::validation(&field.name, format!("must be at least {} characters", min)));
        }
    }
    if let Some(max) = field.rules.max_length {
        if len > max {
            return Err(Error::validation(&field.name, format!("must be at most {} characters", max)));
        }
    }
    if let Some(pattern) = &field.rules.pattern {
        let re = regex::Regex::new(pattern)
            .map_err(|err| Error::validation(&field.name, format!("invalid pattern: {}", err)))?;
        if !re.is_match(value) {
            return Err(Error::validation(&field.name, "does not match the required format"));
        }
    }
    Ok(())
}

fn stamp_text(field: &SnapshotField, value: &str) -> Option<String> {
    match field.field_type {
        FieldType::Checkbox if value == "true" => Some("X".to_string()),
        FieldType::Checkbox => None,
        _ if value.is_empty() => None,
        _ => Some(value.to_string()),
    }
}

impl<S: Store> Engine<S> {
    fn open_submissions(&self, submissions: &[models::FormSubmission]) -> Result<HashMap<(uuid::Uuid, uuid::Uuid), String>> {
        submissions.iter()
            .map(|s| Ok(((s.document_signer_id, s.field_id), self.sealer.open_str(&s.encrypted_value)?)))
            .collect()
    }

    /// Required snapshot fields of `signer` without a non-empty submission.
    fn missing_fields<'a>(
        snapshot: &'a Snapshot,
        signer: &models::DocumentSigner,
        values: &HashMap<(uuid::Uuid, uuid::Uuid), String>,
    ) -> Vec<&'a str> {
        snapshot.fields_for(signer.template_signer_id)
            .filter(|f| f.required)
            .filter(|f| values.get(&(signer.id, f.id)).map_or(true, |v| v.trim().is_empty()))
            .map(|f| f.name.as_str())
            .collect()
    }

    fn notify_sent(&self, detail: &DocumentDetail) {
        for signer in &detail.signers {
            if let Err(err) = self.notifier.document_sent(&detail.document, signer) {
                warn!("Unable to notify {} about document {}: {} {}", signer.signer_email, detail.document.id, err, err.detail());
            }
        }
    }

    pub fn create_document(&self, principal: &Principal, new: NewDocument) -> Result<DocumentDetail> {
        authorize(principal, Action::CreateDocument, Resource::Workspace(principal.workspace_id))?;
        let now = chrono::Utc::now().naive_utc();
        if new.name.trim().is_empty() {
            return Err(Error::validation("name", "document name is required"));
        }
        if new.name.chars().count() > MAX_NAME_LEN {
            return Err(Error::validation("name", format!("must be {} characters or less", MAX_NAME_LEN)));
        }
        if let Some(expires_at) = new.expires_at {
            if expires_at <= now {
                return Err(Error::validation("expires_at", "must be in the future"));
            }
        }
        let mut emails = HashSet::new();
        for (i, r) in new.recipients.iter().enumerate() {
            let field = format!("recipients[{}]", i);
            if !EMAIL_RE.is_match(r.email.trim()) {
                return Err(Error::validation(field, format!("invalid email '{}'", r.email)));
            }
            if r.name.trim().is_empty() || r.name.trim().chars().count() > MAX_NAME_LEN {
                return Err(Error::validation(field, "recipient name is required and at most 255 characters"));
            }
            if !emails.insert(r.email.trim().to_lowercase()) {
                return Err(Error::validation(field, format!("duplicate recipient email '{}'", r.email)));
            }
        }

        let detail = self.store.transaction(|tx| {
            let template = load_template(tx, principal, new.template_id, Action::ViewTemplate)?;
            let template_signers = tx.template_signers(template.id)?;
            let template_fields = tx.template_fields(template.id)?;

            let mut by_order = HashMap::new();
            for (i, r) in new.recipients.iter().enumerate() {
                let role = template_signers.iter().find(|s| s.signer_order == r.signer_order)
                    .ok_or_else(|| Error::validation(
                        format!("recipients[{}]", i), format!("template has no signer with order {}", r.signer_order),
                    ))?;
                if by_order.insert(r.signer_order, (role, r)).is_some() {
                    return Err(Error::validation(
                        format!("recipients[{}]", i), format!("signer order {} bound twice", r.signer_order),
                    ));
                }
            }
            if let Some(unbound) = template_signers.iter().find(|s| !by_order.contains_key(&s.signer_order)) {
                return Err(Error::validation(
                    "recipients", format!("no recipient for signer '{}' (order {})", unbound.signer_name, unbound.signer_order),
                ));
            }

            let snapshot = serde_json::to_value(Snapshot::capture(&template, &template_signers, &template_fields)?)
                .map_err(|err| Error::Persistence(format!("Unable to serialize snapshot: {}", err)))?;
            let document = models::Document {
                id: uuid::Uuid::new_v4(),
                template_id: template.id,
                name: new.name.trim().to_string(),
                s3_bucket: None,
                s3_key: None,
                template_snapshot_hash: snapshot_hash(&snapshot)?,
                template_snapshot: snapshot,
                final_hash: None,
                created_by: principal.user_id,
                workspace_id: principal.workspace_id,
                status: DocumentStatus::Draft,
                expires_at: new.expires_at,
                sent_at: None,
                completed_at: None,
                created_at: now,
                updated_at: now,
            };
            let signers = template_signers.iter().map(|role| {
                let (_, r) = by_order[&role.signer_order];
                models::DocumentSigner {
                    id: uuid::Uuid::new_v4(),
                    document_id: document.id,
                    template_signer_id: role.id,
                    signer_order: role.signer_order,
                    signer_email: r.email.trim().to_lowercase(),
                    signer_name: r.name.trim().to_string(),
                    access_token: make_access_token(),
                    status: SignerStatus::Pending,
                    viewed_at: None,
                    completed_at: None,
                    created_at: now,
                }
            }).collect::<Vec<_>>();

            tx.insert_document(&document)?;
            tx.insert_document_signers(&signers)?;
            Ok(DocumentDetail {
                document,
                signers,
            })
        })?;

        info!("Document {} created from template {}", detail.document.id, detail.document.template_id);
        self.record(AuditEvent::document(AuditAction::DocumentCreated, detail.document.id)
            .with_template(detail.document.template_id)
            .by(principal.user_id)
            .details(serde_json::json!({
                "name": detail.document.name,
                "template_snapshot_hash": detail.document.template_snapshot_hash,
                "recipients": detail.signers.len(),
            })));
        Ok(detail)
    }

    pub fn schedule_document(&self, principal: &Principal, id: uuid::Uuid) -> Result<models::Document> {
        self.expire_if_due(id)?;
        self.store.transaction(|tx| {
            let mut document = lock_document(tx, id)?;
            authorize(principal, Action::SendDocument, owned(&document))?;
            match document.status {
                DocumentStatus::Draft => {}
                s if s.is_terminal() => return Err(Error::DocumentClosed(s)),
                s => return Err(Error::Conflict(format!("cannot schedule a {} document", s))),
            }
            set_status(tx, &mut document, DocumentStatus::Scheduled, chrono::Utc::now().naive_utc())?;
            Ok(document)
        })
    }

    /// Distributes the document to its recipients.
    pub fn send_document(&self, principal: &Principal, id: uuid::Uuid) -> Result<DocumentDetail> {
        self.expire_if_due(id)?;
        let detail = self.store.transaction(|tx| {
            let mut document = lock_document(tx, id)?;
            authorize(principal, Action::SendDocument, owned(&document))?;
            match document.status {
                DocumentStatus::Draft | DocumentStatus::Scheduled => {}
                s if s.is_terminal() => return Err(Error::DocumentClosed(s)),
                s => return Err(Error::Conflict(format!("document is already {}", s))),
            }

            let mut signers = tx.document_signers(id)?;
            for signer in signers.iter_mut() {
                if !access_token_is_valid(&signer.access_token) {
                    warn!("Regenerating weak access token for signer {} of document {}", signer.id, id);
                    signer.access_token = make_access_token();
                    tx.update_document_signer(signer)?;
                }
            }

            let now = chrono::Utc::now().naive_utc();
            document.sent_at = Some(now);
            set_status(tx, &mut document, DocumentStatus::Sent, now)?;
            Ok(DocumentDetail {
                document,
                signers,
            })
        })?;

        info!("Document {} sent to {} recipient(s)", id, detail.signers.len());
        self.record(AuditEvent::document(AuditAction::DocumentSent, id)
            .with_template(detail.document.template_id)
            .by(principal.user_id)
            .details(serde_json::json!({
                "recipients": detail.signers.iter().map(|s| s.signer_email.as_str()).collect::<Vec<_>>(),
            })));
        self.notify_sent(&detail);
        Ok(detail)
    }

    /// Resolves a recipient token. Tokens of documents that were never
    /// distributed are reported as unknown.
    pub fn signer_by_token(&self, token: &str) -> Result<models::DocumentSigner> {
        if !access_token_is_valid(token) {
            return Err(Error::NotFound);
        }
        let signer = self.store.transaction(|tx| tx.document_signer_by_token(token))?
            .ok_or(Error::NotFound)?;
        self.expire_if_due(signer.document_id)?;

        self.store.transaction(|tx| {
            let document = tx.document(signer.document_id)?.ok_or(Error::NotFound)?;
            check_recipient_access(&document, chrono::Utc::now().naive_utc())?;
            tx.document_signer(signer.id)?.ok_or(Error::NotFound)
        })
    }

    /// A recipient opened the document. The first view moves the signer to
    /// viewed and a sent document to in progress.
    pub fn record_view(&self, token: &str, client: &ClientMeta) -> Result<SignerSession> {
        let signer = self.signer_by_token(token)?;

        let (session, first_view) = self.store.transaction(|tx| {
            let now = chrono::Utc::now().naive_utc();
            let mut document = lock_document(tx, signer.document_id)?;
            check_recipient_access(&document, now)?;

            let mut signer = tx.document_signer(signer.id)?.ok_or(Error::NotFound)?;
            let first_view = signer.viewed_at.is_none();
            if first_view {
                signer.viewed_at = Some(now);
                if signer.status == SignerStatus::Pending {
                    signer.status = SignerStatus::Viewed;
                }
                tx.update_document_signer(&signer)?;
            }
            if document.status == DocumentStatus::Sent {
                set_status(tx, &mut document, DocumentStatus::InProgress, now)?;
            }

            let snapshot = load_snapshot(&document)?;
            let fields = snapshot.fields_for(signer.template_signer_id).cloned().collect();
            Ok((SignerSession {
                document,
                signer,
                fields,
            }, first_view))
        })?;

        if first_view {
            self.record(AuditEvent::document(AuditAction::DocumentViewed, session.document.id)
                .details(serde_json::json!({"signer": session.signer.id, "email": session.signer.signer_email}))
                .from_client(client));
        }
        Ok(session)
    }

    /// Validates, seals and stores one field value, replacing any earlier
    /// value for the same field.
    pub fn submit_field(&self, document_signer_id: uuid::Uuid, field_id: uuid::Uuid, value: &str, client: &ClientMeta) -> Result<models::FormSubmission> {
        let signer = self.store.transaction(|tx| tx.document_signer(document_signer_id))?
            .ok_or(Error::NotFound)?;
        self.expire_if_due(signer.document_id)?;

        let submission = self.store.transaction(|tx| {
            let now = chrono::Utc::now().naive_utc();
            let mut document = lock_document(tx, signer.document_id)?;
            check_accepts_input(&document, now)?;

            let mut signer = tx.document_signer(document_signer_id)?.ok_or(Error::NotFound)?;
            if signer.status == SignerStatus::Completed {
                return Err(Error::Conflict("signer has already signed".to_string()));
            }

            let snapshot = load_snapshot(&document)?;
            let field = snapshot.fields.iter().find(|f| f.id == field_id).ok_or(Error::NotFound)?;
            if field.signer_id != signer.template_signer_id {
                return Err(Error::Permission(format!("field '{}' is assigned to another signer", field.name)));
            }
            validate_value(field, value)?;

            let submission = models::FormSubmission {
                id: uuid::Uuid::new_v4(),
                document_id: document.id,
                document_signer_id: signer.id,
                field_id: field.id,
                field_name: field.name.clone(),
                field_type: field.field_type,
                encrypted_value: self.sealer.seal_str(value.trim())?,
                encryption_key_id: self.sealer.key_id().to_string(),
                submitted_at: now,
                ip_address: Some(client.ip.into()),
                user_agent: Some(client.user_agent.clone()),
            };
            tx.upsert_submission(&submission)?;

            if document.status == DocumentStatus::Sent {
                set_status(tx, &mut document, DocumentStatus::InProgress, now)?;
            }
            if matches!(signer.status, SignerStatus::Pending | SignerStatus::Viewed) {
                signer.status = SignerStatus::InProgress;
                tx.update_document_signer(&signer)?;
            }
            Ok(submission)
        })?;

        self.record(AuditEvent::document(AuditAction::FieldFilled, submission.document_id)
            .details(serde_json::json!({"signer": submission.document_signer_id, "field": submission.field_name}))
            .from_client(client));
        Ok(submission)
    }

    /// Records the signer's signature. The last signature completes the
    /// document in the same transaction.
    pub fn sign_document(&self, document_signer_id: uuid::Uuid, input: SignatureInput, client: &ClientMeta) -> Result<SignOutcome> {
        if input.signature.is_empty() {
            return Err(Error::validation("signature", "signature is required"));
        }
        if input.algorithm.trim().is_empty() {
            return Err(Error::validation("algorithm", "algorithm is required"));
        }
        let signer = self.store.transaction(|tx| tx.document_signer(document_signer_id))?
            .ok_or(Error::NotFound)?;
        self.expire_if_due(signer.document_id)?;

        let mut written: Option<String> = None;
        let res = self.store.transaction(|tx| {
            let now = chrono::Utc::now().naive_utc();
            let mut document = lock_document(tx, signer.document_id)?;
            check_accepts_input(&document, now)?;

            let mut signer = tx.document_signer(document_signer_id)?.ok_or(Error::NotFound)?;
            if signer.status == SignerStatus::Completed {
                return Err(Error::Conflict("signer has already signed".to_string()));
            }

            let snapshot = load_snapshot(&document)?;
            let values = self.open_submissions(&tx.submissions(document.id)?)?;
            let missing = Self::missing_fields(&snapshot, &signer, &values);
            if !missing.is_empty() {
                return Err(Error::validation("fields", format!("missing required fields: {}", missing.join(", "))));
            }

            let mut signed_values = snapshot.fields_for(signer.template_signer_id)
                .filter_map(|f| values.get(&(signer.id, f.id)).map(|v| format!("{}={}", f.name, v)))
                .collect::<Vec<_>>();
            signed_values.sort();
            let document_hash = hash_hex(format!("{}\n{}", document.template_snapshot_hash, signed_values.join("\n")).as_bytes());

            let mut signature = models::DigitalSignature {
                id: uuid::Uuid::new_v4(),
                document_id: document.id,
                document_signer_id: signer.id,
                signer_email: signer.signer_email.clone(),
                signer_name: signer.signer_name.clone(),
                document_hash,
                final_document_hash: None,
                signature: input.signature,
                certificate: input.certificate,
                algorithm: input.algorithm.trim().to_string(),
                signed_at: now,
                ip_address: Some(client.ip.into()),
                user_agent: Some(client.user_agent.clone()),
            };
            tx.insert_signature(&signature)?;

            signer.status = SignerStatus::Completed;
            signer.completed_at = Some(now);
            tx.update_document_signer(&signer)?;

            if document.status == DocumentStatus::Sent {
                set_status(tx, &mut document, DocumentStatus::InProgress, now)?;
            }

            let signers = tx.document_signers(document.id)?;
            let signed = tx.signatures(document.id)?.iter().map(|s| s.document_signer_id).collect::<HashSet<_>>();
            let complete = signers.iter().all(|s| s.status == SignerStatus::Completed && signed.contains(&s.id))
                && signers.iter().all(|s| Self::missing_fields(&snapshot, s, &values).is_empty());
            if !complete {
                return Ok((signature, None));
            }

            let base = self.files.get_verified(&snapshot.content.key, &snapshot.content.hash)?;
            let mut stamps = Vec::new();
            for field in &snapshot.fields {
                for s in signers.iter().filter(|s| s.template_signer_id == field.signer_id) {
                    if let Some(text) = values.get(&(s.id, field.id)).and_then(|v| stamp_text(field, v)) {
                        stamps.push(pdf::Stamp {
                            page: field.position.page as u32,
                            text,
                            top: field.position.y,
                            left: field.position.x,
                            width: field.position.width,
                            height: field.position.height,
                        });
                    }
                }
            }
            let composed = pdf::compose(&base, &stamps)?;

            let path = format!(
                "documents/{}/{}/{}-{}-signed.pdf",
                document.created_by, document.workspace_id, document.id, uuid::Uuid::new_v4()
            );
            let stored = self.files.put(&composed, &path)?;
            written = Some(path);

            document.s3_bucket = Some(stored.bucket);
            document.s3_key = Some(stored.path);
            document.final_hash = Some(stored.content_hash.clone());
            document.completed_at = Some(now);
            set_status(tx, &mut document, DocumentStatus::Completed, now)?;
            tx.set_final_document_hash(document.id, &stored.content_hash)?;
            signature.final_document_hash = Some(stored.content_hash);

            Ok((signature, Some((document, signers))))
        });

        let (signature, completed) = match res {
            Ok(r) => r,
            Err(err) => {
                if let Some(path) = written {
                    if let Err(cleanup_err) = self.files.delete(&path) {
                        error!("Orphaned final document {}/{}: {} {}", self.files.bucket(), path, cleanup_err, cleanup_err.detail());
                    }
                }
                return Err(err);
            }
        };

        self.record(AuditEvent::document(AuditAction::DocumentSigned, signature.document_id)
            .details(serde_json::json!({
                "signer": signature.document_signer_id,
                "email": signature.signer_email,
                "algorithm": signature.algorithm,
                "document_hash": signature.document_hash,
            }))
            .from_client(client));

        if let Some((document, signers)) = &completed {
            info!("Document {} completed, final hash {}", document.id, document.final_hash.as_deref().unwrap_or_default());
            self.record(AuditEvent::document(AuditAction::DocumentCompleted, document.id)
                .with_template(document.template_id)
                .details(serde_json::json!({
                    "final_hash": document.final_hash,
                    "s3_key": document.s3_key,
                })));
            if let Err(err) = self.notifier.document_completed(document, signers) {
                warn!("Unable to send completion notice for document {}: {} {}", document.id, err, err.detail());
            }
        }

        Ok(SignOutcome {
            signature,
            completed: completed.is_some(),
        })
    }

    pub fn cancel_document(&self, principal: &Principal, id: uuid::Uuid) -> Result<models::Document> {
        let document = self.store.transaction(|tx| {
            let mut document = lock_document(tx, id)?;
            authorize(principal, Action::CancelDocument, owned(&document))?;
            if document.status.is_terminal() {
                return Err(Error::DocumentClosed(document.status));
            }
            set_status(tx, &mut document, DocumentStatus::Cancelled, chrono::Utc::now().naive_utc())?;
            Ok(document)
        })?;

        info!("Document {} cancelled by user {}", id, principal.user_id);
        self.record(AuditEvent::document(AuditAction::DocumentCancelled, id)
            .with_template(document.template_id)
            .by(principal.user_id));
        Ok(document)
    }

    /// Moves the document to expired if its deadline has passed at `now`.
    /// Returns whether it did.
    pub fn expire_document(&self, id: uuid::Uuid, now: chrono::NaiveDateTime) -> Result<bool> {
        let expired = self.store.transaction(|tx| {
            let mut document = lock_document(tx, id)?;
            if !document.is_overdue(now) {
                return Ok(None);
            }
            let previous = document.status;
            set_status(tx, &mut document, DocumentStatus::Expired, now)?;
            Ok(Some((document, previous)))
        })?;

        match expired {
            Some((document, previous)) => {
                info!("Document {} expired", id);
                self.record(AuditEvent::document(AuditAction::DocumentExpired, id)
                    .with_template(document.template_id)
                    .details(serde_json::json!({
                        "previous_status": previous,
                        "expires_at": document.expires_at,
                    })));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn expire_if_due(&self, id: uuid::Uuid) -> Result<()> {
        self.expire_document(id, chrono::Utc::now().naive_utc()).map(|_| ())
    }

    /// Expires every overdue document, returning how many were expired. One
    /// failing document does not stop the sweep.
    pub fn expire_overdue(&self, now: chrono::NaiveDateTime) -> Result<usize> {
        let overdue = self.store.transaction(|tx| tx.overdue_documents(now))?;
        let mut expired = 0;
        for document in overdue {
            match self.expire_document(document.id, now) {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(err) => warn!("Unable to expire document {}: {} {}", document.id, err, err.detail()),
            }
        }
        Ok(expired)
    }

    pub fn get_document(&self, principal: &Principal, id: uuid::Uuid) -> Result<DocumentDetail> {
        self.store.transaction(|tx| load_document(tx, principal, id, Action::ViewDocument))?;
        self.expire_if_due(id)?;
        self.store.transaction(|tx| {
            let document = load_document(tx, principal, id, Action::ViewDocument)?;
            let signers = tx.document_signers(id)?;
            Ok(DocumentDetail {
                document,
                signers,
            })
        })
    }

    fn completed_document(&self, principal: &Principal, id: uuid::Uuid) -> Result<(String, String)> {
        let document = self.store.transaction(|tx| load_document(tx, principal, id, Action::ViewDocument))?;
        match (document.status, document.s3_key, document.final_hash) {
            (DocumentStatus::Completed, Some(key), Some(hash)) => Ok((key, hash)),
            (status, _, _) => Err(Error::Conflict(format!("document is {}, not completed", status))),
        }
    }

    pub fn fetch_final_document(&self, principal: &Principal, id: uuid::Uuid) -> Result<Vec<u8>> {
        let (key, hash) = self.completed_document(principal, id)?;
        self.files.get_verified(&key, &hash)
    }

    /// Time-limited download link for the final document.
    pub fn final_document_link(&self, principal: &Principal, id: uuid::Uuid, ttl: chrono::Duration) -> Result<DocumentLink> {
        let (path, _) = self.completed_document(principal, id)?;
        Ok(DocumentLink {
            key: self.files.presign(&path, ttl),
            path,
        })
    }

    pub fn open_document_link(&self, path: &str, key: &str) -> Result<Vec<u8>> {
        Ok(self.files.open_presigned(path, key)?.data)
    }

    pub fn audit_trail(&self, principal: &Principal, id: uuid::Uuid) -> Result<Vec<models::AuditLogEntry>> {
        self.store.transaction(|tx| {
            load_document(tx, principal, id, Action::ViewDocument)?;
            tx.audit_entries(id)
        })
    }
}
