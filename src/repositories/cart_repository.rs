use async_trait::async_trait;
use tracing::instrument;

use super::HttpBackend;
use crate::models::{Cart, RepositoryResult};

/// Backend access to carts
#[async_trait]
pub trait CartRepository: Send + Sync {
    /// Static demo cart used when the live backend does not answer
    async fn find_static_cart(&self) -> RepositoryResult<Cart>;

    /// The live cart of a user
    async fn find_cart(&self, user_id: &str) -> RepositoryResult<Cart>;

    /// Persist a cart and return the backend's version of it
    async fn save_cart(&self, cart: &Cart) -> RepositoryResult<Cart>;
}

#[async_trait]
impl CartRepository for HttpBackend {
    #[instrument(skip(self))]
    async fn find_static_cart(&self) -> RepositoryResult<Cart> {
        self.get_json("commande.json", &["api", "commande.json"])
            .await
    }

    #[instrument(skip(self))]
    async fn find_cart(&self, user_id: &str) -> RepositoryResult<Cart> {
        self.get_json("getPanier", &["api", "getPanier", user_id])
            .await
    }

    #[instrument(skip(self, cart), fields(stores = cart.stores.len(), price = %cart.price))]
    async fn save_cart(&self, cart: &Cart) -> RepositoryResult<Cart> {
        self.post_json(
            "updatePanier",
            &["api", "updatePanier", ""],
            &cart.for_backend(),
        )
        .await
    }
}
