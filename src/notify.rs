use crate::{models, Result};

/// Outbound hook for recipient-facing events. Called after the triggering
/// change has committed; errors are logged by the caller and never undo it.
pub trait Notifier: Send + Sync {
    fn document_sent(&self, document: &models::Document, signer: &models::DocumentSigner) -> Result<()>;

    fn document_completed(&self, document: &models::Document, signers: &[models::DocumentSigner]) -> Result<()>;
}

pub type NotifierType = std::sync::Arc<dyn Notifier>;

/// Writes events to the log for deployments without a delivery service.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn document_sent(&self, document: &models::Document, signer: &models::DocumentSigner) -> Result<()> {
        info!(
            "Signature requested from {} <{}> for document {} ({})",
            signer.signer_name, signer.signer_email, document.name, document.id
        );
        Ok(())
    }

    fn document_completed(&self, document: &models::Document, signers: &[models::DocumentSigner]) -> Result<()> {
        info!(
            "Document {} ({}) completed, notifying {}",
            document.name,
            document.id,
            signers.iter().map(|s| s.signer_email.as_str()).collect::<Vec<_>>().join(", ")
        );
        Ok(())
    }
}

#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    pub sent: std::sync::Mutex<Vec<(uuid::Uuid, String)>>,
    pub completed: std::sync::Mutex<Vec<uuid::Uuid>>,
    pub fail: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl Notifier for RecordingNotifier {
    fn document_sent(&self, document: &models::Document, signer: &models::DocumentSigner) -> Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(crate::Error::Storage("mail relay down".to_string()));
        }
        self.sent.lock().unwrap().push((document.id, signer.signer_email.clone()));
        Ok(())
    }

    fn document_completed(&self, document: &models::Document, _signers: &[models::DocumentSigner]) -> Result<()> {
        self.completed.lock().unwrap().push(document.id);
        Ok(())
    }
}
