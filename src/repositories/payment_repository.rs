use async_trait::async_trait;
use serde_json::Value;
use tracing::instrument;

use super::HttpBackend;
use crate::models::{Cart, PaymentConfirmation, PaymentToken, RepositoryResult};

/// Backend access to the payment endpoints
#[async_trait]
pub trait PaymentRepository: Send + Sync {
    /// Static demo token
    async fn find_static_payment_token(&self) -> RepositoryResult<PaymentToken>;

    /// Open a payment for `cart`
    async fn request_payment_token(&self, cart: &Cart) -> RepositoryResult<PaymentToken>;

    /// Forward the payer's approval; the backend's answer is passed through as is
    async fn confirm_payment(&self, confirmation: &PaymentConfirmation) -> RepositoryResult<Value>;
}

#[async_trait]
impl PaymentRepository for HttpBackend {
    #[instrument(skip(self))]
    async fn find_static_payment_token(&self) -> RepositoryResult<PaymentToken> {
        self.get_json("pay.json", &["api", "pay.json"]).await
    }

    #[instrument(skip(self, cart), fields(price = %cart.price))]
    async fn request_payment_token(&self, cart: &Cart) -> RepositoryResult<PaymentToken> {
        self.post_json("pay", &["api", "pay"], &cart.for_backend())
            .await
    }

    #[instrument(skip(self, confirmation), fields(payment_id = %confirmation.payment_id))]
    async fn confirm_payment(&self, confirmation: &PaymentConfirmation) -> RepositoryResult<Value> {
        self.post_for_value("pay/success", &["api", "pay", "success"], confirmation)
            .await
    }
}
