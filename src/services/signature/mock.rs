use super::WebhookVerifier;

/// Returns a fixed verdict for every payload.
pub struct StaticWebhookVerifier {
    pub accept: bool,
}

impl StaticWebhookVerifier {
    pub fn accepting() -> Self {
        Self { accept: true }
    }

    pub fn rejecting() -> Self {
        Self { accept: false }
    }
}

impl WebhookVerifier for StaticWebhookVerifier {
    fn verify(&self, _payload: &[u8], _signature: &str) -> bool {
        self.accept
    }
}
