//! Runs against a scratch database named by `DATABASE_URL`; skipped when the
//! variable is unset.

use esign_core::auth::{Principal, Role};
use esign_core::catalog::{FieldInput, NewTemplate, SignerInput};
use esign_core::models;
use esign_core::schema::{DocumentStatus, SignerStatus};
use esign_core::store::{PgStore, Store, Tx};
use esign_core::workflow::{NewDocument, Recipient, SignatureInput};
use esign_core::{ClientMeta, Engine, Error, ErrorKind};

fn store() -> Option<PgStore> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let store = PgStore::connect(&url, 2).unwrap();
    store.run_migrations().unwrap();
    Some(store)
}

fn now() -> chrono::NaiveDateTime {
    chrono::Utc::now().naive_utc()
}

fn template(workspace_id: uuid::Uuid) -> models::Template {
    models::Template {
        id: uuid::Uuid::new_v4(),
        name: "Lease".to_string(),
        description: String::new(),
        s3_bucket: "esign".to_string(),
        s3_key: "templates/1/lease.pdf".to_string(),
        pdf_hash: "0".repeat(64),
        file_size: 1024,
        mime_type: "application/pdf".to_string(),
        total_pages: 1,
        created_by: 1,
        workspace_id,
        is_active: true,
        version: 1,
        created_at: now(),
        updated_at: now(),
    }
}

fn document(template: &models::Template) -> models::Document {
    let snapshot = serde_json::json!({"template_id": template.id});
    models::Document {
        id: uuid::Uuid::new_v4(),
        template_id: template.id,
        name: "Lease for unit 4".to_string(),
        s3_bucket: None,
        s3_key: None,
        template_snapshot_hash: esign_core::workflow::snapshot_hash(&snapshot).unwrap(),
        template_snapshot: snapshot,
        final_hash: None,
        created_by: 1,
        workspace_id: template.workspace_id,
        status: DocumentStatus::Sent,
        expires_at: Some(now() - chrono::Duration::minutes(1)),
        sent_at: Some(now()),
        completed_at: None,
        created_at: now(),
        updated_at: now(),
    }
}

fn signer(document: &models::Document, order: i32, token: &str) -> models::DocumentSigner {
    models::DocumentSigner {
        id: uuid::Uuid::new_v4(),
        document_id: document.id,
        template_signer_id: uuid::Uuid::new_v4(),
        signer_order: order,
        signer_email: format!("signer{}@example.com", order),
        signer_name: format!("Signer {}", order),
        access_token: token.to_string(),
        status: SignerStatus::Pending,
        viewed_at: None,
        completed_at: None,
        created_at: now(),
    }
}

#[test]
fn failed_transaction_rolls_back() {
    let store = match store() {
        Some(s) => s,
        None => return,
    };
    let t = template(uuid::Uuid::new_v4());

    let res: Result<(), Error> = store.transaction(|tx| {
        tx.insert_template(&t)?;
        Err(Error::validation("name", "rejected"))
    });
    assert!(res.is_err());
    assert!(store.transaction(|tx| tx.template(t.id)).unwrap().is_none());
}

#[test]
fn document_round_trip_and_status_guard() {
    let store = match store() {
        Some(s) => s,
        None => return,
    };
    let t = template(uuid::Uuid::new_v4());
    let mut d = document(&t);
    let token = esign_core::crypto::make_access_token();

    store.transaction(|tx| {
        tx.insert_template(&t)?;
        tx.insert_document(&d)?;
        tx.insert_document_signers(&[signer(&d, 1, &token)])
    }).unwrap();

    let loaded = store.transaction(|tx| tx.document(d.id)).unwrap().unwrap();
    assert_eq!(loaded.template_snapshot, d.template_snapshot);
    assert_eq!(
        esign_core::workflow::snapshot_hash(&loaded.template_snapshot).unwrap(),
        loaded.template_snapshot_hash
    );

    let found = store.transaction(|tx| tx.document_signer_by_token(&token)).unwrap().unwrap();
    assert_eq!(found.document_id, d.id);

    let overdue = store.transaction(|tx| tx.overdue_documents(now())).unwrap();
    assert!(overdue.iter().any(|o| o.id == d.id));

    d.status = DocumentStatus::Expired;
    assert!(!store.transaction(|tx| tx.update_document(&d, DocumentStatus::Draft)).unwrap());
    assert!(store.transaction(|tx| tx.update_document(&d, DocumentStatus::Sent)).unwrap());
    assert!(!store.transaction(|tx| tx.update_document(&d, DocumentStatus::Sent)).unwrap());
}

#[test]
fn duplicate_tokens_conflict() {
    let store = match store() {
        Some(s) => s,
        None => return,
    };
    let t = template(uuid::Uuid::new_v4());
    let d = document(&t);
    let token = esign_core::crypto::make_access_token();

    let err = store.transaction(|tx| {
        tx.insert_template(&t)?;
        tx.insert_document(&d)?;
        tx.insert_document_signers(&[signer(&d, 1, &token), signer(&d, 2, &token)])
    }).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

fn one_page_pdf() -> Vec<u8> {
    use lopdf::content::{Content, Operation};
    use lopdf::dictionary;

    let mut doc = lopdf::Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(lopdf::dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let content = Content {
        operations: vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 24.into()]),
            Operation::new("Td", vec![100.into(), 600.into()]),
            Operation::new("Tj", vec![lopdf::Object::string_literal("Bill of sale")]),
            Operation::new("ET", vec![]),
        ],
    };
    let content_id = doc.add_object(lopdf::Stream::new(lopdf::dictionary! {}, content.encode().unwrap()));
    let page_id = doc.add_object(lopdf::dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "Resources" => lopdf::dictionary! {
            "Font" => lopdf::dictionary! { "F1" => font_id },
        },
        "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
    });
    doc.objects.insert(pages_id, lopdf::Object::Dictionary(lopdf::dictionary! {
        "Type" => "Pages",
        "Kids" => vec![page_id.into()],
        "Count" => 1,
    }));
    let catalog_id = doc.add_object(lopdf::dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).unwrap();
    out
}

fn role_field(name: &str, signer: i32) -> FieldInput {
    FieldInput {
        name: name.to_string(),
        field_type: "signature".to_string(),
        signer,
        label: String::new(),
        placeholder: String::new(),
        position: models::Position {
            x: 0.1,
            y: 0.1 * signer as f64,
            width: 0.3,
            height: 0.05,
            page: 1,
        },
        rules: Default::default(),
        required: true,
    }
}

#[test]
fn concurrent_last_signatures_complete_once() {
    let store = match store() {
        Some(s) => s,
        None => return,
    };
    let dir = tempfile::tempdir().unwrap();
    let sealer = std::sync::Arc::new(esign_core::crypto::Sealer::new(&[9u8; 32]).unwrap());
    let files = std::sync::Arc::new(
        esign_core::files::ContentStore::new(dir.path(), "esign", sealer.clone(), b"link-key").unwrap()
    );
    let engine = Engine::new(store, files, sealer, std::sync::Arc::new(esign_core::notify::LogNotifier));

    let owner = Principal {
        user_id: 77,
        workspace_id: uuid::Uuid::new_v4(),
        role: Role::Owner,
    };
    let client = ClientMeta {
        ip: "198.51.100.4".parse().unwrap(),
        user_agent: "integration".to_string(),
    };
    let t = engine.create_template(&owner, NewTemplate {
        name: "Bill of sale".to_string(),
        description: String::new(),
        pdf: one_page_pdf(),
        signers: vec![
            SignerInput { order: 1, name: "Buyer".to_string(), color: "#3366ff".to_string() },
            SignerInput { order: 2, name: "Seller".to_string(), color: "#ff6633".to_string() },
        ],
        fields: vec![role_field("buyer_signature", 1), role_field("seller_signature", 2)],
    }).unwrap();

    for round in 0..3 {
        let d = engine.create_document(&owner, NewDocument {
            template_id: t.template.id,
            name: format!("Bill of sale {}", round),
            recipients: vec![
                Recipient { signer_order: 1, email: "buyer@example.com".to_string(), name: "Buyer".to_string() },
                Recipient { signer_order: 2, email: "seller@example.com".to_string(), name: "Seller".to_string() },
            ],
            expires_at: None,
        }).unwrap();
        let sent = engine.send_document(&owner, d.document.id).unwrap();
        for signer in &sent.signers {
            let field = t.fields.iter().find(|f| f.signer_id == signer.template_signer_id).unwrap();
            engine.submit_field(signer.id, field.id, signer.signer_name.as_str(), &client).unwrap();
        }

        let engine = &engine;
        let client = &client;
        let outcomes = std::thread::scope(|scope| {
            let handles = sent.signers.iter().map(|signer| {
                let signer_id = signer.id;
                scope.spawn(move || engine.sign_document(signer_id, SignatureInput {
                    signature: vec![1, 2, 3],
                    certificate: None,
                    algorithm: "ed25519".to_string(),
                }, client).unwrap())
            }).collect::<Vec<_>>();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect::<Vec<_>>()
        });

        assert_eq!(outcomes.iter().filter(|o| o.completed).count(), 1);
        let detail = engine.get_document(&owner, d.document.id).unwrap();
        assert_eq!(detail.document.status, DocumentStatus::Completed);

        let prefix = format!("{}-", d.document.id);
        let finals = std::fs::read_dir(dir.path().join(format!("esign/documents/77/{}", owner.workspace_id)))
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with(&prefix))
            .count();
        assert_eq!(finals, 1);

        let signatures = engine.store().transaction(|tx| tx.signatures(d.document.id)).unwrap();
        assert_eq!(signatures.len(), 2);
        assert!(signatures.iter().all(|s| s.final_document_hash == detail.document.final_hash));
    }
}
