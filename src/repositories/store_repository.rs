use async_trait::async_trait;
use tracing::instrument;

use super::HttpBackend;
use crate::models::{RepositoryResult, StoreOrder};

/// Backend access to the stores delivering a residence
#[async_trait]
pub trait StoreRepository: Send + Sync {
    /// Static demo store list
    async fn find_static_stores(&self) -> RepositoryResult<Vec<StoreOrder>>;

    async fn find_stores_of_residence(&self, residence_id: &str)
        -> RepositoryResult<Vec<StoreOrder>>;
}

#[async_trait]
impl StoreRepository for HttpBackend {
    #[instrument(skip(self))]
    async fn find_static_stores(&self) -> RepositoryResult<Vec<StoreOrder>> {
        self.get_json("listMagasins.json", &["api", "listMagasins.json"])
            .await
    }

    #[instrument(skip(self))]
    async fn find_stores_of_residence(
        &self,
        residence_id: &str,
    ) -> RepositoryResult<Vec<StoreOrder>> {
        self.get_json(
            "getMagasinsOfResidence",
            &["api", "getMagasinsOfResidence", residence_id],
        )
        .await
    }
}
