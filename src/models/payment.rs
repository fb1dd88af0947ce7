use serde::{Deserialize, Serialize};

/// Token identifying a payment session opened for a cart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentToken {
    #[serde(rename = "paymentID")]
    pub payment_id: String,
}

/// Data sent back once the payer approved the payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    #[serde(rename = "paymentID")]
    pub payment_id: String,
    #[serde(rename = "payerID")]
    pub payer_id: String,
}
