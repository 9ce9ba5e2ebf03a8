//! Templates: a source PDF with ordered signer roles and the fields each role
//! fills in.

use std::collections::{HashMap, HashSet};
use crate::auth::{authorize, Action, Principal, Resource};
use crate::audit::AuditEvent;
use crate::models::{Position, ValidationRules};
use crate::schema::{AuditAction, FieldType};
use crate::store::{Store, Tx};
use crate::{models, pdf, Engine, Error, Result};

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_DESCRIPTION_LEN: usize = 500;

#[derive(Deserialize, Clone, Debug)]
pub struct SignerInput {
    pub order: i32,
    pub name: String,
    pub color: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct FieldInput {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    /// Order of the signer role that fills this field.
    pub signer: i32,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub placeholder: String,
    pub position: Position,
    #[serde(default)]
    pub rules: ValidationRules,
    #[serde(default)]
    pub required: bool,
}

pub struct NewTemplate {
    pub name: String,
    pub description: String,
    pub pdf: Vec<u8>,
    pub signers: Vec<SignerInput>,
    pub fields: Vec<FieldInput>,
}

#[derive(Serialize, Clone, Debug)]
pub struct TemplateDetail {
    pub template: models::Template,
    pub signers: Vec<models::TemplateSigner>,
    pub fields: Vec<models::TemplateField>,
}

#[derive(Serialize, Clone, Debug)]
pub struct TemplateSummary {
    #[serde(flatten)]
    pub template: models::Template,
    pub signer_count: usize,
    pub field_count: usize,
}

#[derive(Serialize, Clone, Debug)]
pub struct SignersReplaced {
    #[serde(flatten)]
    pub detail: TemplateDetail,
    /// Fields deleted along with the old signer set; the caller has to
    /// assign fields again.
    pub fields_removed: usize,
}

fn validate_metadata(name: &str, description: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::validation("name", "template name is required"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(Error::validation("name", format!("must be {} characters or less", MAX_NAME_LEN)));
    }
    if description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(Error::validation("description", format!("must be {} characters or less", MAX_DESCRIPTION_LEN)));
    }
    Ok(())
}

fn is_hex_color(color: &str) -> bool {
    color.len() == 7 && color.starts_with('#') && color[1..].chars().all(|c| c.is_ascii_hexdigit())
}

fn validate_signers(signers: &[SignerInput]) -> Result<()> {
    if signers.is_empty() {
        return Err(Error::validation("signers", "at least one signer is required"));
    }
    let mut orders = HashSet::new();
    for (i, s) in signers.iter().enumerate() {
        let field = format!("signers[{}]", i);
        if s.order <= 0 {
            return Err(Error::validation(field, "order must be positive"));
        }
        if !orders.insert(s.order) {
            return Err(Error::validation(field, format!("duplicate signer order {}", s.order)));
        }
        if s.name.trim().is_empty() {
            return Err(Error::validation(field, "signer name is required"));
        }
        if s.name.trim().chars().count() > MAX_NAME_LEN {
            return Err(Error::validation(field, "signer name too long"));
        }
        if !is_hex_color(&s.color) {
            return Err(Error::validation(
                field, format!("invalid color '{}', must be a hex color like #3B82F6", s.color),
            ));
        }
    }
    Ok(())
}

fn build_signers(template_id: uuid::Uuid, signers: &[SignerInput], now: chrono::NaiveDateTime) -> Vec<models::TemplateSigner> {
    signers.iter().map(|s| models::TemplateSigner {
        id: uuid::Uuid::new_v4(),
        template_id,
        signer_order: s.order,
        signer_name: s.name.trim().to_string(),
        signer_color: s.color.to_ascii_lowercase(),
        created_at: now,
    }).collect()
}

/// Validates every field against the given signer set and page count and
/// builds the rows to insert.
fn build_fields(
    template_id: uuid::Uuid,
    fields: &[FieldInput],
    signers: &[models::TemplateSigner],
    total_pages: i32,
    version: i32,
    now: chrono::NaiveDateTime,
) -> Result<Vec<models::TemplateField>> {
    let signer_ids = signers.iter()
        .map(|s| (s.signer_order, s.id))
        .collect::<HashMap<_, _>>();
    let mut names = HashSet::new();

    fields.iter().enumerate().map(|(i, f)| {
        let field = format!("fields[{}]", i);
        let name = f.name.trim();
        if name.is_empty() {
            return Err(Error::validation(field, "field name is required"));
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(Error::validation(field, "field name too long"));
        }
        if !names.insert(name.to_string()) {
            return Err(Error::validation(field, format!("duplicate field name '{}'", name)));
        }
        let field_type = f.field_type.parse::<FieldType>()
            .map_err(|err| Error::validation(&field, err.to_string()))?;
        let signer_id = *signer_ids.get(&f.signer)
            .ok_or_else(|| Error::validation(&field, format!("references non-existent signer {}", f.signer)))?;
        f.position.validate(&field, total_pages)?;
        f.rules.validate(&field)?;

        Ok(models::TemplateField {
            id: uuid::Uuid::new_v4(),
            template_id,
            signer_id,
            field_name: name.to_string(),
            field_type,
            field_label: f.label.clone(),
            placeholder_text: f.placeholder.clone(),
            page: f.position.page,
            x: f.position.x,
            y: f.position.y,
            width: f.position.width,
            height: f.position.height,
            validation_rules: f.rules.to_json(),
            required: f.required,
            version,
            created_at: now,
        })
    }).collect()
}

/// Loads an active template the principal may act on. Inactive and foreign
/// templates are reported as missing.
pub(crate) fn load_template(tx: &mut dyn Tx, principal: &Principal, id: uuid::Uuid, action: Action) -> Result<models::Template> {
    let template = match tx.template(id)? {
        Some(t) if t.is_active => t,
        _ => return Err(Error::NotFound),
    };
    authorize(principal, action, Resource::Owned {
        workspace_id: template.workspace_id,
        created_by: template.created_by,
    })?;
    Ok(template)
}

/// Fields grouped by their signer's order, creation order within a signer.
fn sort_fields(fields: &mut [models::TemplateField], signers: &[models::TemplateSigner]) {
    let order = signers.iter()
        .map(|s| (s.id, s.signer_order))
        .collect::<HashMap<_, _>>();
    fields.sort_by_key(|f| order.get(&f.signer_id).copied().unwrap_or(i32::MAX));
}

fn load_detail(tx: &mut dyn Tx, template: models::Template) -> Result<TemplateDetail> {
    let signers = tx.template_signers(template.id)?;
    let mut fields = tx.template_fields(template.id)?;
    sort_fields(&mut fields, &signers);
    Ok(TemplateDetail {
        template,
        signers,
        fields,
    })
}

impl<S: Store> Engine<S> {
    pub fn create_template(&self, principal: &Principal, new: NewTemplate) -> Result<TemplateDetail> {
        authorize(principal, Action::CreateTemplate, Resource::Workspace(principal.workspace_id))?;
        validate_metadata(&new.name, &new.description)?;
        if new.pdf.is_empty() {
            return Err(Error::validation("pdf", "PDF file is required"));
        }
        let total_pages = pdf::page_count(&new.pdf)
            .map_err(|err| Error::validation("pdf", format!("unable to read PDF: {}", err)))?;
        if total_pages == 0 {
            return Err(Error::validation("pdf", "PDF has no pages"));
        }
        validate_signers(&new.signers)?;

        let now = chrono::Utc::now().naive_utc();
        let template_id = uuid::Uuid::new_v4();
        let signers = build_signers(template_id, &new.signers, now);
        let fields = build_fields(template_id, &new.fields, &signers, total_pages as i32, 1, now)?;

        let path = format!("templates/{}/{}/{}.pdf", principal.user_id, principal.workspace_id, uuid::Uuid::new_v4());
        let stored = self.files.put(&new.pdf, &path)?;

        let template = models::Template {
            id: template_id,
            name: new.name.trim().to_string(),
            description: new.description.trim().to_string(),
            s3_bucket: stored.bucket,
            s3_key: stored.path,
            pdf_hash: stored.content_hash,
            file_size: stored.size,
            mime_type: "application/pdf".to_string(),
            total_pages: total_pages as i32,
            created_by: principal.user_id,
            workspace_id: principal.workspace_id,
            is_active: true,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        let res = self.store.transaction(|tx| {
            tx.insert_template(&template)?;
            tx.insert_template_signers(&signers)?;
            tx.insert_template_fields(&fields)?;
            Ok(())
        });
        if let Err(err) = res {
            if let Err(cleanup_err) = self.files.delete(&path) {
                error!("Orphaned template content {}/{}: {} {}", self.files.bucket(), path, cleanup_err, cleanup_err.detail());
            }
            return Err(err);
        }

        info!("Template {} created by user {} in workspace {}", template.id, principal.user_id, principal.workspace_id);
        self.record(AuditEvent::template(AuditAction::TemplateCreated, template.id)
            .by(principal.user_id)
            .details(serde_json::json!({
                "name": template.name,
                "signers": signers.len(),
                "fields": fields.len(),
            })));

        let mut fields = fields;
        sort_fields(&mut fields, &signers);
        Ok(TemplateDetail {
            template,
            signers,
            fields,
        })
    }

    pub fn get_template(&self, principal: &Principal, id: uuid::Uuid) -> Result<TemplateDetail> {
        self.store.transaction(|tx| {
            let template = load_template(tx, principal, id, Action::ViewTemplate)?;
            load_detail(tx, template)
        })
    }

    pub fn list_templates(&self, principal: &Principal) -> Result<Vec<TemplateSummary>> {
        authorize(principal, Action::ViewTemplate, Resource::Workspace(principal.workspace_id))?;
        self.store.transaction(|tx| {
            tx.active_templates(principal.workspace_id)?
                .into_iter()
                .map(|template| {
                    let signer_count = tx.template_signers(template.id)?.len();
                    let field_count = tx.template_fields(template.id)?.len();
                    Ok(TemplateSummary {
                        template,
                        signer_count,
                        field_count,
                    })
                })
                .collect()
        })
    }

    pub fn update_template(&self, principal: &Principal, id: uuid::Uuid, name: &str, description: &str) -> Result<models::Template> {
        validate_metadata(name, description)?;
        let template = self.store.transaction(|tx| {
            let mut template = load_template(tx, principal, id, Action::EditTemplate)?;
            template.name = name.trim().to_string();
            template.description = description.trim().to_string();
            template.updated_at = chrono::Utc::now().naive_utc();
            tx.update_template(&template)?;
            Ok(template)
        })?;

        self.record(AuditEvent::template(AuditAction::TemplateUpdated, id)
            .by(principal.user_id)
            .details(serde_json::json!({"change": "metadata", "name": template.name})));
        Ok(template)
    }

    /// Replaces the whole field set against the current signers and bumps the
    /// template version.
    pub fn replace_fields(&self, principal: &Principal, id: uuid::Uuid, fields: Vec<FieldInput>) -> Result<TemplateDetail> {
        let detail = self.store.transaction(|tx| {
            let mut template = load_template(tx, principal, id, Action::EditTemplate)?;
            let signers = tx.template_signers(id)?;
            let now = chrono::Utc::now().naive_utc();
            let new_fields = build_fields(id, &fields, &signers, template.total_pages, template.version + 1, now)?;

            tx.delete_template_fields(id)?;
            tx.insert_template_fields(&new_fields)?;
            template.version += 1;
            template.updated_at = now;
            tx.update_template(&template)?;

            load_detail(tx, template)
        })?;

        self.record(AuditEvent::template(AuditAction::TemplateUpdated, id)
            .by(principal.user_id)
            .details(serde_json::json!({
                "change": "fields",
                "version": detail.template.version,
                "fields": detail.fields.len(),
            })));
        Ok(detail)
    }

    /// Replaces the signer roles. Every field is deleted first since it
    /// points at a role that is about to disappear.
    pub fn replace_signers(&self, principal: &Principal, id: uuid::Uuid, signers: Vec<SignerInput>) -> Result<SignersReplaced> {
        validate_signers(&signers)?;
        let replaced = self.store.transaction(|tx| {
            let mut template = load_template(tx, principal, id, Action::EditTemplate)?;
            let now = chrono::Utc::now().naive_utc();

            let fields_removed = tx.delete_template_fields(id)?;
            tx.delete_template_signers(id)?;
            tx.insert_template_signers(&build_signers(id, &signers, now))?;
            template.version += 1;
            template.updated_at = now;
            tx.update_template(&template)?;

            Ok(SignersReplaced {
                detail: load_detail(tx, template)?,
                fields_removed,
            })
        })?;

        if replaced.fields_removed > 0 {
            warn!("Replacing signers of template {} removed {} field(s)", id, replaced.fields_removed);
        }
        self.record(AuditEvent::template(AuditAction::TemplateUpdated, id)
            .by(principal.user_id)
            .details(serde_json::json!({
                "change": "signers",
                "version": replaced.detail.template.version,
                "signers": replaced.detail.signers.len(),
                "fields_removed": replaced.fields_removed,
            })));
        Ok(replaced)
    }

    pub fn deactivate_template(&self, principal: &Principal, id: uuid::Uuid) -> Result<()> {
        self.store.transaction(|tx| {
            let mut template = load_template(tx, principal, id, Action::DeactivateTemplate)?;
            template.is_active = false;
            template.updated_at = chrono::Utc::now().naive_utc();
            tx.update_template(&template)
        })?;

        self.record(AuditEvent::template(AuditAction::TemplateUpdated, id)
            .by(principal.user_id)
            .details(serde_json::json!({"change": "deactivated"})));
        Ok(())
    }

    pub fn fetch_template_pdf(&self, principal: &Principal, id: uuid::Uuid) -> Result<Vec<u8>> {
        let template = self.store.transaction(|tx| load_template(tx, principal, id, Action::ViewTemplate))?;
        self.files.get_verified(&template.s3_key, &template.pdf_hash)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn signer(order: i32, name: &str) -> SignerInput {
        SignerInput {
            order,
            name: name.to_string(),
            color: "#3B82F6".to_string(),
        }
    }

    pub fn field(name: &str, field_type: &str, signer: i32, required: bool) -> FieldInput {
        FieldInput {
            name: name.to_string(),
            field_type: field_type.to_string(),
            signer,
            label: name.to_string(),
            placeholder: String::new(),
            position: Position {
                x: 0.1,
                y: 0.1 * signer as f64,
                width: 0.3,
                height: 0.04,
                page: 1,
            },
            rules: ValidationRules::default(),
            required,
        }
    }

    /// Buyer (order 1) and Seller (order 2), each with a required name and
    /// signature field. The buyer also has an optional phone field.
    pub fn purchase_agreement() -> NewTemplate {
        NewTemplate {
            name: "Purchase agreement".to_string(),
            description: "Standard residential purchase".to_string(),
            pdf: pdf::sample_pdf(2),
            signers: vec![signer(1, "Buyer"), signer(2, "Seller")],
            fields: vec![
                field("buyer_name", "text", 1, true),
                field("buyer_signature", "signature", 1, true),
                field("buyer_phone", "phone", 1, false),
                field("seller_name", "text", 2, true),
                field("seller_signature", "signature", 2, true),
            ],
        }
    }
}
