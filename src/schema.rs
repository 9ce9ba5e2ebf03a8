#[derive(DbEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Signature,
    Date,
    Checkbox,
    Email,
    Phone,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Signature => "signature",
            Self::Date => "date",
            Self::Checkbox => "checkbox",
            Self::Email => "email",
            Self::Phone => "phone",
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FieldType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "text" => Self::Text,
            "signature" => Self::Signature,
            "date" => Self::Date,
            "checkbox" => Self::Checkbox,
            "email" => Self::Email,
            "phone" => Self::Phone,
            other => return Err(crate::Error::validation(
                "type",
                format!("invalid field type '{}', must be one of: text, signature, date, checkbox, email, phone", other),
            )),
        })
    }
}

#[derive(DbEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Draft,
    Scheduled,
    Sent,
    InProgress,
    Completed,
    Expired,
    Cancelled,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Sent => "sent",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Expired | Self::Cancelled)
    }

    /// Recipients may only act on distributed, still-open documents.
    pub fn accepts_input(&self) -> bool {
        matches!(self, Self::Sent | Self::InProgress)
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(DbEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SignerStatus {
    Pending,
    Viewed,
    InProgress,
    Completed,
}

#[derive(DbEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    TemplateCreated,
    TemplateUpdated,
    DocumentCreated,
    DocumentSent,
    DocumentViewed,
    FieldFilled,
    DocumentSigned,
    DocumentCompleted,
    DocumentExpired,
    DocumentCancelled,
}

table! {
    templates (id) {
        id -> Uuid,
        name -> Varchar,
        description -> Varchar,
        s3_bucket -> Varchar,
        s3_key -> Varchar,
        pdf_hash -> Varchar,
        file_size -> Int8,
        mime_type -> Varchar,
        total_pages -> Int4,
        created_by -> Int8,
        workspace_id -> Uuid,
        is_active -> Bool,
        version -> Int4,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

table! {
    template_signers (id) {
        id -> Uuid,
        template_id -> Uuid,
        signer_order -> Int4,
        signer_name -> Varchar,
        signer_color -> Varchar,
        created_at -> Timestamp,
    }
}

table! {
    template_fields (id) {
        id -> Uuid,
        template_id -> Uuid,
        signer_id -> Uuid,
        field_name -> Varchar,
        field_type -> crate::schema::FieldTypeMapping,
        field_label -> Varchar,
        placeholder_text -> Varchar,
        page -> Int4,
        x -> Float8,
        y -> Float8,
        width -> Float8,
        height -> Float8,
        validation_rules -> Jsonb,
        required -> Bool,
        version -> Int4,
        created_at -> Timestamp,
    }
}

table! {
    documents (id) {
        id -> Uuid,
        template_id -> Uuid,
        name -> Varchar,
        s3_bucket -> Nullable<Varchar>,
        s3_key -> Nullable<Varchar>,
        template_snapshot_hash -> Varchar,
        template_snapshot -> Jsonb,
        final_hash -> Nullable<Varchar>,
        created_by -> Int8,
        workspace_id -> Uuid,
        status -> crate::schema::DocumentStatusMapping,
        expires_at -> Nullable<Timestamp>,
        sent_at -> Nullable<Timestamp>,
        completed_at -> Nullable<Timestamp>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

table! {
    document_signers (id) {
        id -> Uuid,
        document_id -> Uuid,
        template_signer_id -> Uuid,
        signer_order -> Int4,
        signer_email -> Varchar,
        signer_name -> Varchar,
        access_token -> Varchar,
        status -> crate::schema::SignerStatusMapping,
        viewed_at -> Nullable<Timestamp>,
        completed_at -> Nullable<Timestamp>,
        created_at -> Timestamp,
    }
}

table! {
    form_submissions (id) {
        id -> Uuid,
        document_id -> Uuid,
        document_signer_id -> Uuid,
        field_id -> Uuid,
        field_name -> Varchar,
        field_type -> crate::schema::FieldTypeMapping,
        encrypted_value -> Text,
        encryption_key_id -> Varchar,
        submitted_at -> Timestamp,
        ip_address -> Nullable<Inet>,
        user_agent -> Nullable<Varchar>,
    }
}

table! {
    digital_signatures (id) {
        id -> Uuid,
        document_id -> Uuid,
        document_signer_id -> Uuid,
        signer_email -> Varchar,
        signer_name -> Varchar,
        document_hash -> Varchar,
        final_document_hash -> Nullable<Varchar>,
        signature -> Bytea,
        certificate -> Nullable<Text>,
        algorithm -> Varchar,
        signed_at -> Timestamp,
        ip_address -> Nullable<Inet>,
        user_agent -> Nullable<Varchar>,
    }
}

table! {
    document_audit_log (id) {
        id -> Uuid,
        document_id -> Nullable<Uuid>,
        template_id -> Nullable<Uuid>,
        user_id -> Nullable<Int8>,
        action -> crate::schema::AuditActionMapping,
        details -> Jsonb,
        ip_address -> Nullable<Inet>,
        user_agent -> Nullable<Varchar>,
        created_at -> Timestamp,
    }
}

joinable!(template_signers -> templates (template_id));
joinable!(template_fields -> templates (template_id));
joinable!(template_fields -> template_signers (signer_id));
joinable!(documents -> templates (template_id));
joinable!(document_signers -> documents (document_id));
joinable!(form_submissions -> documents (document_id));
joinable!(form_submissions -> document_signers (document_signer_id));
joinable!(digital_signatures -> documents (document_id));
joinable!(digital_signatures -> document_signers (document_signer_id));

allow_tables_to_appear_in_same_query!(
    templates,
    template_signers,
    template_fields,
    documents,
    document_signers,
    form_submissions,
    digital_signatures,
    document_audit_log,
);
