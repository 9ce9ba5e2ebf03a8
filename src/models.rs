use crate::schema::*;

#[derive(Insertable, Queryable, Identifiable, AsChangeset, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[table_name="templates"]
pub struct Template {
    pub id: uuid::Uuid,
    pub name: String,
    pub description: String,
    pub s3_bucket: String,
    pub s3_key: String,
    pub pdf_hash: String,
    pub file_size: i64,
    pub mime_type: String,
    pub total_pages: i32,
    pub created_by: i64,
    pub workspace_id: uuid::Uuid,
    pub is_active: bool,
    pub version: i32,
    pub created_at: chrono::NaiveDateTime,
    pub updated_at: chrono::NaiveDateTime,
}

#[derive(Insertable, Queryable, Identifiable, AsChangeset, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[table_name="template_signers"]
pub struct TemplateSigner {
    pub id: uuid::Uuid,
    pub template_id: uuid::Uuid,
    pub signer_order: i32,
    pub signer_name: String,
    pub signer_color: String,
    pub created_at: chrono::NaiveDateTime,
}

#[derive(Insertable, Queryable, Identifiable, AsChangeset, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[table_name="template_fields"]
pub struct TemplateField {
    pub id: uuid::Uuid,
    pub template_id: uuid::Uuid,
    pub signer_id: uuid::Uuid,
    pub field_name: String,
    pub field_type: FieldType,
    pub field_label: String,
    pub placeholder_text: String,
    pub page: i32,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub validation_rules: serde_json::Value,
    pub required: bool,
    pub version: i32,
    pub created_at: chrono::NaiveDateTime,
}

impl TemplateField {
    pub fn position(&self) -> Position {
        Position {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            page: self.page,
        }
    }

    /// Rules are stored as an open JSON object; unknown keys are ignored.
    pub fn rules(&self) -> crate::Result<ValidationRules> {
        serde_json::from_value(self.validation_rules.clone()).map_err(|err| {
            error!("Unreadable validation rules on field {} ({}): {}", self.id, self.field_name, err);
            crate::Error::Integrity(format!("unreadable validation rules on field {}: {}", self.id, err))
        })
    }
}

#[derive(Insertable, Queryable, Identifiable, AsChangeset, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[table_name="documents"]
#[changeset_options(treat_none_as_null="true")]
pub struct Document {
    pub id: uuid::Uuid,
    pub template_id: uuid::Uuid,
    pub name: String,
    pub s3_bucket: Option<String>,
    pub s3_key: Option<String>,
    pub template_snapshot_hash: String,
    pub template_snapshot: serde_json::Value,
    pub final_hash: Option<String>,
    pub created_by: i64,
    pub workspace_id: uuid::Uuid,
    pub status: DocumentStatus,
    pub expires_at: Option<chrono::NaiveDateTime>,
    pub sent_at: Option<chrono::NaiveDateTime>,
    pub completed_at: Option<chrono::NaiveDateTime>,
    pub created_at: chrono::NaiveDateTime,
    pub updated_at: chrono::NaiveDateTime,
}

impl Document {
    pub fn is_overdue(&self, now: chrono::NaiveDateTime) -> bool {
        !self.status.is_terminal() && self.expires_at.map_or(false, |e| e <= now)
    }
}

#[derive(Insertable, Queryable, Identifiable, AsChangeset, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[table_name="document_signers"]
#[changeset_options(treat_none_as_null="true")]
pub struct DocumentSigner {
    pub id: uuid::Uuid,
    pub document_id: uuid::Uuid,
    pub template_signer_id: uuid::Uuid,
    pub signer_order: i32,
    pub signer_email: String,
    pub signer_name: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    pub status: SignerStatus,
    pub viewed_at: Option<chrono::NaiveDateTime>,
    pub completed_at: Option<chrono::NaiveDateTime>,
    pub created_at: chrono::NaiveDateTime,
}

#[derive(Insertable, Queryable, Identifiable, AsChangeset, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[table_name="form_submissions"]
pub struct FormSubmission {
    pub id: uuid::Uuid,
    pub document_id: uuid::Uuid,
    pub document_signer_id: uuid::Uuid,
    pub field_id: uuid::Uuid,
    pub field_name: String,
    pub field_type: FieldType,
    pub encrypted_value: String,
    pub encryption_key_id: String,
    pub submitted_at: chrono::NaiveDateTime,
    #[serde(serialize_with = "ip_only")]
    pub ip_address: Option<ipnetwork::IpNetwork>,
    pub user_agent: Option<String>,
}

#[derive(Insertable, Queryable, Identifiable, AsChangeset, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[table_name="digital_signatures"]
pub struct DigitalSignature {
    pub id: uuid::Uuid,
    pub document_id: uuid::Uuid,
    pub document_signer_id: uuid::Uuid,
    pub signer_email: String,
    pub signer_name: String,
    pub document_hash: String,
    pub final_document_hash: Option<String>,
    #[serde(serialize_with = "hex_encode")]
    pub signature: Vec<u8>,
    pub certificate: Option<String>,
    pub algorithm: String,
    pub signed_at: chrono::NaiveDateTime,
    #[serde(serialize_with = "ip_only")]
    pub ip_address: Option<ipnetwork::IpNetwork>,
    pub user_agent: Option<String>,
}

#[derive(Insertable, Queryable, Identifiable, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[table_name="document_audit_log"]
pub struct AuditLogEntry {
    pub id: uuid::Uuid,
    pub document_id: Option<uuid::Uuid>,
    pub template_id: Option<uuid::Uuid>,
    pub user_id: Option<i64>,
    pub action: AuditAction,
    pub details: serde_json::Value,
    #[serde(serialize_with = "ip_only")]
    pub ip_address: Option<ipnetwork::IpNetwork>,
    pub user_agent: Option<String>,
    pub created_at: chrono::NaiveDateTime,
}

/// Where a field sits on the source PDF, as fractions of the page measured
/// from the top-left corner.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub page: i32,
}

impl Position {
    pub fn validate(&self, field: &str, total_pages: i32) -> crate::Result<()> {
        for (name, value) in [("x", self.x), ("y", self.y), ("width", self.width), ("height", self.height)] {
            if !value.is_finite() {
                return Err(crate::Error::validation(field, format!("position '{}' must be a number", name)));
            }
        }
        if self.x < 0.0 || self.y < 0.0 {
            return Err(crate::Error::validation(field, "position 'x' and 'y' must be non-negative"));
        }
        if self.width <= 0.0 || self.height <= 0.0 {
            return Err(crate::Error::validation(field, "position 'width' and 'height' must be greater than 0"));
        }
        if self.page < 1 || self.page > total_pages {
            return Err(crate::Error::validation(
                field, format!("page {} is outside the document's {} page(s)", self.page, total_pages),
            ));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ValidationRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl ValidationRules {
    pub fn validate(&self, field: &str) -> crate::Result<()> {
        if let (Some(min), Some(max)) = (self.min_length, self.max_length) {
            if min > max {
                return Err(crate::Error::validation(field, "min_length exceeds max_length"));
            }
        }
        if let Some(pattern) = &self.pattern {
            if let Err(err) = regex::Regex::new(pattern) {
                return Err(crate::Error::validation(field, format!("invalid pattern: {}", err)));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }
}

fn hex_encode<S: serde::Serializer>(val: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(val))
}

fn ip_only<S: serde::Serializer>(val: &Option<ipnetwork::IpNetwork>, s: S) -> Result<S::Ok, S::Error> {
    match val {
        Some(ip) => s.serialize_str(&ip.ip().to_string()),
        None => s.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(x: f64, y: f64, width: f64, height: f64, page: i32) -> Position {
        Position { x, y, width, height, page }
    }

    #[test]
    fn position_bounds() {
        assert!(pos(0.0, 0.0, 0.2, 0.05, 1).validate("f", 1).is_ok());
        assert!(pos(-0.1, 0.0, 0.2, 0.05, 1).validate("f", 1).is_err());
        assert!(pos(0.1, 0.1, 0.0, 0.05, 1).validate("f", 1).is_err());
        assert!(pos(0.1, 0.1, 0.2, -1.0, 1).validate("f", 1).is_err());
        assert!(pos(0.1, 0.1, 0.2, 0.1, 2).validate("f", 1).is_err());
        assert!(pos(f64::NAN, 0.1, 0.2, 0.1, 1).validate("f", 1).is_err());
    }

    #[test]
    fn rules_reject_bad_pattern_and_inverted_bounds() {
        let rules = ValidationRules { pattern: Some("([a-z".into()), ..Default::default() };
        assert!(rules.validate("zip").is_err());
        let rules = ValidationRules { min_length: Some(5), max_length: Some(2), pattern: None };
        assert!(rules.validate("zip").is_err());
    }

    #[test]
    fn malformed_rules_are_an_integrity_error() {
        let mut field = TemplateField {
            id: uuid::Uuid::new_v4(),
            template_id: uuid::Uuid::new_v4(),
            signer_id: uuid::Uuid::new_v4(),
            field_name: "zip".to_string(),
            field_type: FieldType::Text,
            field_label: String::new(),
            placeholder_text: String::new(),
            page: 1,
            x: 0.1,
            y: 0.1,
            width: 0.2,
            height: 0.05,
            validation_rules: serde_json::json!({"max_length": 5, "note": "ignored"}),
            required: true,
            version: 1,
            created_at: chrono::Utc::now().naive_utc(),
        };
        assert_eq!(field.rules().unwrap().max_length, Some(5));

        field.validation_rules = serde_json::json!({"min_length": "five"});
        assert!(matches!(field.rules(), Err(crate::Error::Integrity(_))));
        field.validation_rules = serde_json::json!("digits only");
        assert!(matches!(field.rules(), Err(crate::Error::Integrity(_))));
    }

    #[test]
    fn rules_round_trip_through_json_column() {
        let rules = ValidationRules { min_length: Some(5), max_length: None, pattern: Some("^[0-9]+$".into()) };
        let value = rules.to_json();
        assert_eq!(value, serde_json::json!({"min_length": 5, "pattern": "^[0-9]+$"}));
        assert_eq!(serde_json::from_value::<ValidationRules>(value).unwrap(), rules);
    }
}
