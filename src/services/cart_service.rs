use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::event_bus::{CartEventBus, CartSubscription};
use super::fallback::{resolve, Resolved};
use super::user_locks::UserLocks;
use crate::config::EventsConfig;
use crate::models::{
    Cart, CartChangeEvent, CartEventType, ChangeCause, LineItem, PaymentConfirmation,
    PaymentToken, ServiceError, ServiceResult, StoreOrder,
};
use crate::observability::Metrics;
use crate::repositories::{CartRepository, PaymentRepository, StoreRepository};

const MSG_RELOAD: &str = "Your cart was changed from another page";
const MSG_LOAD: &str = "Cart loaded";
const MSG_ADDED: &str = "Item added";
const MSG_REMOVED: &str = "Item removed";
const MSG_UPDATED: &str = "Cart updated";
const MSG_DELIVERY: &str = "Delivery time updated";

/// Answer used for a payment confirmation when the backend does not respond
const CONFIRMATION_FALLBACK: &str = "success";

/// Keeps the current cart in sync with the backend and broadcasts every change
pub struct CartService {
    carts: Arc<dyn CartRepository>,
    stores: Arc<dyn StoreRepository>,
    payments: Arc<dyn PaymentRepository>,
    bus: CartEventBus,
    user_locks: UserLocks,
    metrics: Option<Arc<Metrics>>,
}

impl CartService {
    pub fn new(
        carts: Arc<dyn CartRepository>,
        stores: Arc<dyn StoreRepository>,
        payments: Arc<dyn PaymentRepository>,
        events: &EventsConfig,
    ) -> Self {
        Self {
            carts,
            stores,
            payments,
            bus: CartEventBus::new(events.event_channel_capacity),
            user_locks: UserLocks::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replace the current cart and notify subscribers.
    ///
    /// The current cart is updated before any subscriber sees the event.
    #[instrument(skip(self, cart, cause), fields(cause = %cause.name))]
    pub fn set_cart(&self, cart: Cart, cause: ChangeCause) -> CartChangeEvent {
        let event = self.bus.publish(cart, cause);
        if let Some(metrics) = &self.metrics {
            metrics.record_cart_event(event.cause.name.as_str());
        }
        event
    }

    /// The last published cart, `None` until a cart has been loaded
    pub fn current_cart(&self) -> Option<Cart> {
        self.bus.current()
    }

    /// Subscribe to cart changes published from now on
    pub fn on_change_cart(&self) -> CartSubscription {
        self.bus.subscribe()
    }

    /// Load the user's cart, falling back to the static cart.
    ///
    /// Publishes `load` or `reLoad` when the loaded cart differs from the
    /// current one.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn fetch_cart(&self, user_id: &str) -> ServiceResult<Cart> {
        validate_id("User ID", user_id)?;

        let result = self.load_cart(user_id).await;
        self.record_operation("fetch_cart", result.is_ok());
        result
    }

    async fn load_cart(&self, user_id: &str) -> ServiceResult<Cart> {
        let resolved = resolve(
            self.carts.find_cart(user_id),
            self.carts.find_static_cart(),
        )
        .await?;
        let cart = self.track_source("cart", resolved);

        match self.bus.current() {
            Some(current) if current == cart => {}
            Some(_) => {
                info!("Cart changed on the backend");
                self.set_cart(
                    cart.clone(),
                    ChangeCause::new(CartEventType::ReLoad).with_message(MSG_RELOAD),
                );
            }
            None => {
                self.set_cart(
                    cart.clone(),
                    ChangeCause::new(CartEventType::Load).with_message(MSG_LOAD),
                );
            }
        }

        Ok(cart)
    }

    /// Stores delivering a residence, every product marked as not bought
    #[instrument(skip(self), fields(residence_id = %residence_id))]
    pub async fn fetch_stores_for_residence(
        &self,
        residence_id: &str,
    ) -> ServiceResult<Vec<StoreOrder>> {
        validate_id("Residence ID", residence_id)?;

        let result = resolve(
            self.stores.find_stores_of_residence(residence_id),
            self.stores.find_static_stores(),
        )
        .await
        .map_err(ServiceError::from);
        self.record_operation("fetch_stores", result.is_ok());

        let mut stores = self.track_source("stores", result?);
        for store in &mut stores {
            store.reset_display_state();
        }

        info!(stores = stores.len(), "Residence stores loaded");
        Ok(stores)
    }

    /// Persist `cart` with a freshly computed price and publish the backend's answer
    #[instrument(skip(self, cart, cause), fields(user_id = %user_id, cause = %cause.name))]
    pub async fn update_cart(
        &self,
        user_id: &str,
        cart: Cart,
        cause: ChangeCause,
    ) -> ServiceResult<Cart> {
        validate_id("User ID", user_id)?;
        self.save_and_publish(cart, cause).await
    }

    async fn save_and_publish(&self, mut cart: Cart, cause: ChangeCause) -> ServiceResult<Cart> {
        cart.refresh_price();

        let result = resolve(self.carts.save_cart(&cart), self.carts.find_static_cart())
            .await
            .map_err(ServiceError::from);
        self.record_operation("update_cart", result.is_ok());

        let saved = match result {
            Ok(resolved) => self.track_source("cart_update", resolved),
            Err(e) => {
                warn!(error = %e, "Cart update failed, nothing published");
                return Err(e);
            }
        };

        self.set_cart(saved.clone(), cause);
        Ok(saved)
    }

    /// Add `quantity` units of `item` from `store` to the user's cart
    #[instrument(
        skip(self, store, item),
        fields(user_id = %user_id, store_id = %store.id, denomination = %item.denomination)
    )]
    pub async fn add_item(
        &self,
        user_id: &str,
        store: &StoreOrder,
        item: &LineItem,
        quantity: u32,
    ) -> ServiceResult<Cart> {
        validate_id("User ID", user_id)?;
        validate_id("Store ID", &store.id)?;
        validate_id("Denomination", &item.denomination)?;

        let _guard = self.user_locks.acquire(user_id).await;

        let mut cart = self.fetch_cart(user_id).await?;
        let added = cart.add_item(store, item, quantity).clone();
        let cause = ChangeCause::new(CartEventType::AddArticle)
            .with_message(MSG_ADDED)
            .with_data(&added)?;

        self.save_and_publish(cart, cause).await
    }

    /// Remove every line of `item` from `store` in the user's cart
    #[instrument(
        skip(self, store, item),
        fields(user_id = %user_id, store_id = %store.id, denomination = %item.denomination)
    )]
    pub async fn remove_item(
        &self,
        user_id: &str,
        store: &StoreOrder,
        item: &LineItem,
    ) -> ServiceResult<Cart> {
        validate_id("User ID", user_id)?;
        validate_id("Store ID", &store.id)?;
        validate_id("Denomination", &item.denomination)?;

        let _guard = self.user_locks.acquire(user_id).await;
        self.remove_item_locked(user_id, &store.id, &item.denomination)
            .await
    }

    async fn remove_item_locked(
        &self,
        user_id: &str,
        store_id: &str,
        denomination: &str,
    ) -> ServiceResult<Cart> {
        let mut cart = self.fetch_cart(user_id).await?;

        let removed = match cart.remove_item(store_id, denomination) {
            Some(removed) if !removed.is_empty() => removed,
            _ => return Err(item_no_longer_in_cart(store_id, denomination)),
        };
        let cause = ChangeCause::new(CartEventType::RemoveArticle)
            .with_message(MSG_REMOVED)
            .with_data(&removed)?;

        self.save_and_publish(cart, cause).await
    }

    /// Set the quantity of a line item; a quantity below one removes it
    #[instrument(
        skip(self, store, item),
        fields(user_id = %user_id, store_id = %store.id, denomination = %item.denomination)
    )]
    pub async fn change_item_quantity(
        &self,
        user_id: &str,
        store: &StoreOrder,
        item: &LineItem,
        quantity: i64,
    ) -> ServiceResult<Cart> {
        validate_id("User ID", user_id)?;
        validate_id("Store ID", &store.id)?;
        validate_id("Denomination", &item.denomination)?;

        let _guard = self.user_locks.acquire(user_id).await;

        if quantity < 1 {
            return self
                .remove_item_locked(user_id, &store.id, &item.denomination)
                .await;
        }
        let quantity = u32::try_from(quantity).map_err(|_| ServiceError::ValidationError {
            message: format!("Quantity {} is too large", quantity),
        })?;

        let mut cart = self.fetch_cart(user_id).await?;
        let updated = cart
            .set_item_quantity(&store.id, &item.denomination, quantity)
            .cloned()
            .ok_or_else(|| item_no_longer_in_cart(&store.id, &item.denomination))?;
        let cause = ChangeCause::new(CartEventType::ChangeQteArticle)
            .with_message(MSG_UPDATED)
            .with_data(&updated)?;

        self.save_and_publish(cart, cause).await
    }

    /// Change the delivery time of the current cart locally.
    ///
    /// Nothing is sent to the backend and no event is published; use
    /// [`CartService::persist_delivery_date`] to save it.
    #[instrument(skip(self))]
    pub fn change_delivery_date(&self, date: DateTime<Utc>) -> ServiceResult<Cart> {
        if !self.bus.edit_current(|cart| cart.delivery_time = Some(date.into())) {
            return Err(ServiceError::NoCurrentCart);
        }
        self.bus.current().ok_or(ServiceError::NoCurrentCart)
    }

    /// Save a new delivery time for the user's cart
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn persist_delivery_date(
        &self,
        user_id: &str,
        date: DateTime<Utc>,
    ) -> ServiceResult<Cart> {
        validate_id("User ID", user_id)?;

        let _guard = self.user_locks.acquire(user_id).await;

        let mut cart = self.fetch_cart(user_id).await?;
        cart.delivery_time = Some(date.into());
        let cause = ChangeCause::new(CartEventType::ChangeDeliveryDate)
            .with_message(MSG_DELIVERY)
            .with_data(&date)?;

        self.save_and_publish(cart, cause).await
    }

    /// Open a payment for `cart`, falling back to the static token
    #[instrument(skip(self, cart), fields(price = %cart.price))]
    pub async fn get_payment_token(&self, cart: &Cart) -> ServiceResult<PaymentToken> {
        let result = resolve(
            self.payments.request_payment_token(cart),
            self.payments.find_static_payment_token(),
        )
        .await
        .map_err(ServiceError::from);
        self.record_operation("payment_token", result.is_ok());

        Ok(self.track_source("payment_token", result?))
    }

    /// Forward a payment approval; answers `"success"` when the backend is unreachable
    #[instrument(skip(self, confirmation), fields(payment_id = %confirmation.payment_id))]
    pub async fn send_payment_confirmation(
        &self,
        confirmation: &PaymentConfirmation,
    ) -> ServiceResult<Value> {
        let result = resolve(self.payments.confirm_payment(confirmation), async {
            Ok(Value::String(CONFIRMATION_FALLBACK.to_string()))
        })
        .await
        .map_err(ServiceError::from);
        self.record_operation("payment_confirmation", result.is_ok());

        Ok(self.track_source("payment_confirmation", result?))
    }

    fn track_source<T>(&self, resource: &str, resolved: Resolved<T>) -> T {
        if let Some(metrics) = &self.metrics {
            metrics.record_fallback_resolution(resource, resolved.source.as_str());
        }
        resolved.value
    }

    fn record_operation(&self, operation: &str, success: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_cart_operation(operation, success);
        }
    }
}

fn validate_id(what: &str, value: &str) -> ServiceResult<()> {
    if value.trim().is_empty() {
        return Err(ServiceError::ValidationError {
            message: format!("{} cannot be empty", what),
        });
    }
    Ok(())
}

fn item_no_longer_in_cart(store_id: &str, denomination: &str) -> ServiceError {
    ServiceError::ItemNoLongerInCart {
        store_id: store_id.to_string(),
        denomination: denomination.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeliveryTime, RepositoryError, RepositoryResult};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use mockall::{mock, predicate::eq};
    use rust_decimal_macros::dec;
    use serde_json::json;

    mock! {
        TestCartRepository {}

        #[async_trait]
        impl CartRepository for TestCartRepository {
            async fn find_static_cart(&self) -> RepositoryResult<Cart>;
            async fn find_cart(&self, user_id: &str) -> RepositoryResult<Cart>;
            async fn save_cart(&self, cart: &Cart) -> RepositoryResult<Cart>;
        }
    }

    mock! {
        TestStoreRepository {}

        #[async_trait]
        impl StoreRepository for TestStoreRepository {
            async fn find_static_stores(&self) -> RepositoryResult<Vec<StoreOrder>>;
            async fn find_stores_of_residence(&self, residence_id: &str) -> RepositoryResult<Vec<StoreOrder>>;
        }
    }

    mock! {
        TestPaymentRepository {}

        #[async_trait]
        impl PaymentRepository for TestPaymentRepository {
            async fn find_static_payment_token(&self) -> RepositoryResult<PaymentToken>;
            async fn request_payment_token(&self, cart: &Cart) -> RepositoryResult<PaymentToken>;
            async fn confirm_payment(&self, confirmation: &PaymentConfirmation) -> RepositoryResult<Value>;
        }
    }

    fn backend_down() -> RepositoryError {
        RepositoryError::ConnectionFailed {
            message: "connection refused".to_string(),
        }
    }

    /// S1 sells bread at 2, one in the cart
    fn bread_cart() -> Cart {
        let mut cart = Cart::new();
        cart.add_item(&StoreOrder::new("S1"), &LineItem::new("bread", dec!(2), 1), 1);
        cart.refresh_price();
        cart
    }

    fn static_cart() -> Cart {
        let mut cart = Cart::new();
        cart.add_item(&StoreOrder::new("DEMO"), &LineItem::new("demo", dec!(1), 1), 1);
        cart.refresh_price();
        cart
    }

    /// Cart repository whose live cart is `live` and which echoes saved carts
    fn cart_repo(live: Cart) -> MockTestCartRepository {
        let mut carts = MockTestCartRepository::new();
        carts
            .expect_find_cart()
            .with(eq("u1".to_string()))
            .returning(move |_| Ok(live.clone()));
        carts
            .expect_find_static_cart()
            .returning(|| Ok(static_cart()));
        carts
    }

    fn service(carts: MockTestCartRepository) -> CartService {
        service_with(
            carts,
            MockTestStoreRepository::new(),
            MockTestPaymentRepository::new(),
        )
    }

    fn service_with(
        carts: MockTestCartRepository,
        stores: MockTestStoreRepository,
        payments: MockTestPaymentRepository,
    ) -> CartService {
        CartService::new(
            Arc::new(carts),
            Arc::new(stores),
            Arc::new(payments),
            &EventsConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_fetch_cart_first_load_publishes_load() {
        let service = service(cart_repo(bread_cart()));
        let mut events = service.on_change_cart();

        let cart = service.fetch_cart("u1").await.unwrap();

        assert_eq!(cart, bread_cart());
        assert_eq!(service.current_cart(), Some(bread_cart()));
        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type(), CartEventType::Load);
        assert_eq!(event.cause.message.as_deref(), Some("Cart loaded"));
        assert!(event.previous.is_none());
    }

    #[tokio::test]
    async fn test_fetch_cart_unchanged_publishes_nothing() {
        let service = service(cart_repo(bread_cart()));
        service.fetch_cart("u1").await.unwrap();

        let mut events = service.on_change_cart();
        service.fetch_cart("u1").await.unwrap();

        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_fetch_cart_changed_elsewhere_publishes_reload() {
        let service = service(cart_repo(bread_cart()));
        service.set_cart(static_cart(), ChangeCause::new(CartEventType::Load));
        let mut events = service.on_change_cart();

        service.fetch_cart("u1").await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type(), CartEventType::ReLoad);
        assert_eq!(
            event.cause.message.as_deref(),
            Some("Your cart was changed from another page")
        );
        assert_eq!(event.previous, Some(static_cart()));
    }

    #[tokio::test]
    async fn test_fetch_cart_falls_back_to_static() {
        let mut carts = MockTestCartRepository::new();
        carts.expect_find_cart().returning(|_| Err(backend_down()));
        carts
            .expect_find_static_cart()
            .returning(|| Ok(static_cart()));
        let service = service(carts);

        let cart = service.fetch_cart("u1").await.unwrap();

        assert_eq!(cart, static_cart());
        assert_eq!(service.current_cart(), Some(static_cart()));
    }

    #[tokio::test]
    async fn test_fetch_cart_both_failing_returns_live_error() {
        let mut carts = MockTestCartRepository::new();
        carts.expect_find_cart().returning(|_| Err(RepositoryError::Timeout));
        carts
            .expect_find_static_cart()
            .returning(|| Err(backend_down()));
        let service = service(carts);

        let result = service.fetch_cart("u1").await;

        assert!(matches!(
            result,
            Err(ServiceError::Repository {
                source: RepositoryError::Timeout
            })
        ));
        assert!(service.current_cart().is_none());
    }

    #[tokio::test]
    async fn test_add_item_increments_existing_line() {
        let mut carts = cart_repo(bread_cart());
        carts
            .expect_save_cart()
            .withf(|cart: &Cart| {
                cart.item("S1", "bread").map(|item| item.quantity) == Some(3)
                    && cart.price == dec!(6)
            })
            .times(1)
            .returning(|cart| Ok(cart.clone()));
        let service = service(carts);
        service.fetch_cart("u1").await.unwrap();
        let mut events = service.on_change_cart();

        let cart = service
            .add_item(
                "u1",
                &StoreOrder::new("S1"),
                &LineItem::new("bread", dec!(2), 1),
                2,
            )
            .await
            .unwrap();

        assert_eq!(cart.item("S1", "bread").unwrap().quantity, 3);
        assert_eq!(service.current_cart(), Some(cart));

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type(), CartEventType::AddArticle);
        assert_eq!(event.cause.message.as_deref(), Some("Item added"));
        assert_eq!(event.cause.data.as_ref().unwrap()["nb"], json!(3));
    }

    #[tokio::test]
    async fn test_add_item_creates_store_order() {
        let mut carts = cart_repo(Cart::new());
        carts
            .expect_save_cart()
            .times(1)
            .returning(|cart| Ok(cart.clone()));
        let service = service(carts);

        let mut store = StoreOrder::new("S9");
        store.items.push(LineItem::new("other", dec!(5), 1));
        let cart = service
            .add_item("u1", &store, &LineItem::new("apple", dec!(0.5), 7), 4)
            .await
            .unwrap();

        assert_eq!(cart.stores.len(), 1);
        assert_eq!(cart.stores[0].id, "S9");
        assert_eq!(cart.stores[0].items.len(), 1);
        assert_eq!(cart.stores[0].items[0].quantity, 4);
        assert_eq!(cart.price, dec!(2));
    }

    #[tokio::test]
    async fn test_remove_item_from_absent_store_fails() {
        let mut carts = cart_repo(bread_cart());
        carts.expect_save_cart().never();
        let service = service(carts);
        service.fetch_cart("u1").await.unwrap();

        let result = service
            .remove_item("u1", &StoreOrder::new("S2"), &LineItem::new("bread", dec!(2), 1))
            .await;

        assert!(matches!(
            result,
            Err(ServiceError::ItemNoLongerInCart { ref store_id, .. }) if store_id == "S2"
        ));
        assert_eq!(service.current_cart(), Some(bread_cart()));
    }

    #[tokio::test]
    async fn test_remove_absent_item_fails() {
        let mut carts = cart_repo(bread_cart());
        carts.expect_save_cart().never();
        let service = service(carts);

        let result = service
            .remove_item("u1", &StoreOrder::new("S1"), &LineItem::new("milk", dec!(1), 1))
            .await;

        assert!(matches!(result, Err(ServiceError::ItemNoLongerInCart { .. })));
    }

    #[tokio::test]
    async fn test_remove_item_publishes_removed_lines() {
        let mut carts = cart_repo(bread_cart());
        carts
            .expect_save_cart()
            .withf(|cart: &Cart| cart.item("S1", "bread").is_none() && cart.price == dec!(0))
            .times(1)
            .returning(|cart| Ok(cart.clone()));
        let service = service(carts);
        service.fetch_cart("u1").await.unwrap();
        let mut events = service.on_change_cart();

        let cart = service
            .remove_item("u1", &StoreOrder::new("S1"), &LineItem::new("bread", dec!(2), 1))
            .await
            .unwrap();

        assert_eq!(cart.stores.len(), 1);
        assert!(cart.stores[0].items.is_empty());
        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type(), CartEventType::RemoveArticle);
        assert_eq!(event.cause.message.as_deref(), Some("Item removed"));
        assert_eq!(event.cause.data.as_ref().unwrap()[0]["denomination"], json!("bread"));
    }

    #[tokio::test]
    async fn test_change_quantity_to_zero_removes_item() {
        let mut carts = cart_repo(bread_cart());
        carts
            .expect_save_cart()
            .times(1)
            .returning(|cart| Ok(cart.clone()));
        let service = service(carts);
        service.fetch_cart("u1").await.unwrap();
        let mut events = service.on_change_cart();

        let cart = service
            .change_item_quantity(
                "u1",
                &StoreOrder::new("S1"),
                &LineItem::new("bread", dec!(2), 1),
                0,
            )
            .await
            .unwrap();

        assert!(cart.item("S1", "bread").is_none());
        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type(), CartEventType::RemoveArticle);
    }

    #[tokio::test]
    async fn test_change_quantity_sets_without_incrementing() {
        let mut carts = cart_repo(bread_cart());
        carts
            .expect_save_cart()
            .withf(|cart: &Cart| cart.price == dec!(10))
            .times(1)
            .returning(|cart| Ok(cart.clone()));
        let service = service(carts);
        service.fetch_cart("u1").await.unwrap();
        let mut events = service.on_change_cart();

        let cart = service
            .change_item_quantity(
                "u1",
                &StoreOrder::new("S1"),
                &LineItem::new("bread", dec!(2), 1),
                5,
            )
            .await
            .unwrap();

        assert_eq!(cart.item("S1", "bread").unwrap().quantity, 5);
        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type(), CartEventType::ChangeQteArticle);
        assert_eq!(event.cause.message.as_deref(), Some("Cart updated"));
    }

    #[tokio::test]
    async fn test_change_quantity_of_absent_item_fails() {
        let mut carts = cart_repo(bread_cart());
        carts.expect_save_cart().never();
        let service = service(carts);

        let result = service
            .change_item_quantity(
                "u1",
                &StoreOrder::new("S1"),
                &LineItem::new("milk", dec!(1), 1),
                2,
            )
            .await;

        assert!(matches!(result, Err(ServiceError::ItemNoLongerInCart { .. })));
    }

    #[tokio::test]
    async fn test_update_cart_sends_recomputed_price() {
        let mut carts = MockTestCartRepository::new();
        carts
            .expect_find_static_cart()
            .returning(|| Ok(static_cart()));
        carts
            .expect_save_cart()
            .withf(|cart: &Cart| cart.price == dec!(2))
            .times(1)
            .returning(|cart| Ok(cart.clone()));
        let service = service(carts);

        let mut stale = bread_cart();
        stale.price = dec!(999);
        let saved = service
            .update_cart("u1", stale, ChangeCause::new(CartEventType::AddArticle))
            .await
            .unwrap();

        assert_eq!(saved.price, dec!(2));
    }

    #[tokio::test]
    async fn test_update_cart_publishes_backend_version() {
        let mut carts = MockTestCartRepository::new();
        carts
            .expect_find_static_cart()
            .returning(|| Ok(static_cart()));
        carts.expect_save_cart().returning(|cart| {
            let mut saved = cart.clone();
            saved.extra.insert("id".to_string(), json!("server-1"));
            Ok(saved)
        });
        let service = service(carts);

        let saved = service
            .update_cart("u1", bread_cart(), ChangeCause::new(CartEventType::AddArticle))
            .await
            .unwrap();

        assert_eq!(saved.extra["id"], json!("server-1"));
        assert_eq!(service.current_cart(), Some(saved));
    }

    #[tokio::test]
    async fn test_update_cart_failure_publishes_nothing() {
        let mut carts = MockTestCartRepository::new();
        carts
            .expect_find_static_cart()
            .returning(|| Err(backend_down()));
        carts.expect_save_cart().returning(|_| Err(backend_down()));
        let service = service(carts);
        service.set_cart(bread_cart(), ChangeCause::new(CartEventType::Load));
        let mut events = service.on_change_cart();

        let result = service
            .update_cart("u1", static_cart(), ChangeCause::new(CartEventType::AddArticle))
            .await;

        assert!(result.is_err());
        assert!(events.try_recv().is_none());
        assert_eq!(service.current_cart(), Some(bread_cart()));
    }

    #[tokio::test]
    async fn test_change_delivery_date_without_cart() {
        let service = service(MockTestCartRepository::new());
        let date = Utc.with_ymd_and_hms(2024, 5, 1, 18, 30, 0).unwrap();

        assert!(matches!(
            service.change_delivery_date(date),
            Err(ServiceError::NoCurrentCart)
        ));
    }

    #[tokio::test]
    async fn test_change_delivery_date_is_local_only() {
        let mut carts = MockTestCartRepository::new();
        carts.expect_save_cart().never();
        let service = service(carts);
        service.set_cart(bread_cart(), ChangeCause::new(CartEventType::Load));
        let mut events = service.on_change_cart();
        let date = Utc.with_ymd_and_hms(2024, 5, 1, 18, 30, 0).unwrap();

        let cart = service.change_delivery_date(date).unwrap();

        assert_eq!(cart.delivery_time, Some(DeliveryTime::from(date)));
        assert_eq!(
            service.current_cart().unwrap().delivery_time,
            Some(DeliveryTime::from(date))
        );
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_persist_delivery_date() {
        let date = Utc.with_ymd_and_hms(2024, 5, 1, 18, 30, 0).unwrap();
        let mut carts = cart_repo(bread_cart());
        carts
            .expect_save_cart()
            .withf(move |cart: &Cart| {
                cart.delivery_time.as_ref().and_then(DeliveryTime::to_utc) == Some(date)
            })
            .times(1)
            .returning(|cart| Ok(cart.clone()));
        let service = service(carts);
        service.fetch_cart("u1").await.unwrap();
        let mut events = service.on_change_cart();

        let cart = service.persist_delivery_date("u1", date).await.unwrap();

        assert_eq!(cart.delivery_time, Some(DeliveryTime::from(date)));
        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type(), CartEventType::ChangeDeliveryDate);
    }

    #[tokio::test]
    async fn test_fetch_stores_resets_display_state() {
        let mut stores = MockTestStoreRepository::new();
        stores
            .expect_find_stores_of_residence()
            .with(eq("R1".to_string()))
            .returning(|_| {
                let mut store = StoreOrder::new("S1");
                let mut bread = LineItem::new("bread", dec!(2), 0);
                bread.display = Some(crate::models::DisplayState { is_buyed: true });
                store.items.push(bread);
                store.items.push(LineItem::new("milk", dec!(1), 0));
                Ok(vec![store])
            });
        stores.expect_find_static_stores().returning(|| Ok(vec![]));
        let service = service_with(
            MockTestCartRepository::new(),
            stores,
            MockTestPaymentRepository::new(),
        );
        let mut events = service.on_change_cart();

        let result = service.fetch_stores_for_residence("R1").await.unwrap();

        assert_eq!(result.len(), 1);
        assert!(result[0]
            .items
            .iter()
            .all(|item| item.display.map(|d| d.is_buyed) == Some(false)));
        assert!(service.current_cart().is_none());
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_fetch_stores_falls_back_to_static_list() {
        let mut stores = MockTestStoreRepository::new();
        stores
            .expect_find_stores_of_residence()
            .returning(|_| Err(RepositoryError::Timeout));
        stores
            .expect_find_static_stores()
            .returning(|| Ok(vec![StoreOrder::new("DEMO")]));
        let service = service_with(
            MockTestCartRepository::new(),
            stores,
            MockTestPaymentRepository::new(),
        );

        let result = service.fetch_stores_for_residence("R1").await.unwrap();

        assert_eq!(result[0].id, "DEMO");
    }

    #[tokio::test]
    async fn test_get_payment_token() {
        let mut payments = MockTestPaymentRepository::new();
        payments.expect_request_payment_token().returning(|_| {
            Ok(PaymentToken {
                payment_id: "PAY-LIVE".to_string(),
            })
        });
        payments.expect_find_static_payment_token().returning(|| {
            Ok(PaymentToken {
                payment_id: "PAY-STATIC".to_string(),
            })
        });
        let service = service_with(
            MockTestCartRepository::new(),
            MockTestStoreRepository::new(),
            payments,
        );
        let mut events = service.on_change_cart();

        let token = service.get_payment_token(&bread_cart()).await.unwrap();

        assert_eq!(token.payment_id, "PAY-LIVE");
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_get_payment_token_falls_back() {
        let mut payments = MockTestPaymentRepository::new();
        payments
            .expect_request_payment_token()
            .returning(|_| Err(backend_down()));
        payments.expect_find_static_payment_token().returning(|| {
            Ok(PaymentToken {
                payment_id: "PAY-STATIC".to_string(),
            })
        });
        let service = service_with(
            MockTestCartRepository::new(),
            MockTestStoreRepository::new(),
            payments,
        );

        let token = service.get_payment_token(&bread_cart()).await.unwrap();

        assert_eq!(token.payment_id, "PAY-STATIC");
    }

    #[tokio::test]
    async fn test_payment_confirmation_passes_backend_answer_through() {
        let mut payments = MockTestPaymentRepository::new();
        payments
            .expect_confirm_payment()
            .withf(|confirmation: &PaymentConfirmation| confirmation.payer_id == "PAYER-1")
            .returning(|_| Ok(json!({"state": "approved"})));
        let service = service_with(
            MockTestCartRepository::new(),
            MockTestStoreRepository::new(),
            payments,
        );

        let answer = service
            .send_payment_confirmation(&PaymentConfirmation {
                payment_id: "PAY-1".to_string(),
                payer_id: "PAYER-1".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(answer, json!({"state": "approved"}));
    }

    #[tokio::test]
    async fn test_payment_confirmation_falls_back_to_success() {
        let mut payments = MockTestPaymentRepository::new();
        payments
            .expect_confirm_payment()
            .returning(|_| Err(RepositoryError::Timeout));
        let service = service_with(
            MockTestCartRepository::new(),
            MockTestStoreRepository::new(),
            payments,
        );

        let answer = service
            .send_payment_confirmation(&PaymentConfirmation {
                payment_id: "PAY-1".to_string(),
                payer_id: "PAYER-1".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(answer, json!("success"));
    }

    #[tokio::test]
    async fn test_set_cart_round_trip() {
        let service = service(MockTestCartRepository::new());
        let mut cart = bread_cart();
        cart.extra.insert("note".to_string(), json!("ring twice"));

        service.set_cart(cart.clone(), ChangeCause::new(CartEventType::Load));

        assert_eq!(service.current_cart(), Some(cart));
    }

    #[tokio::test]
    async fn test_validation_errors_skip_backend() {
        let service = service(MockTestCartRepository::new());

        assert!(matches!(
            service.fetch_cart("  ").await,
            Err(ServiceError::ValidationError { .. })
        ));
        assert!(matches!(
            service.fetch_stores_for_residence("").await,
            Err(ServiceError::ValidationError { .. })
        ));
        assert!(matches!(
            service
                .add_item("u1", &StoreOrder::new(""), &LineItem::new("bread", dec!(2), 1), 1)
                .await,
            Err(ServiceError::ValidationError { .. })
        ));
        assert!(matches!(
            service
                .remove_item("u1", &StoreOrder::new("S1"), &LineItem::new("", dec!(2), 1))
                .await,
            Err(ServiceError::ValidationError { .. })
        ));
    }

    #[tokio::test]
    async fn test_metrics_record_fallbacks_and_events() {
        let mut carts = MockTestCartRepository::new();
        carts.expect_find_cart().returning(|_| Err(backend_down()));
        carts
            .expect_find_static_cart()
            .returning(|| Ok(static_cart()));
        let metrics = Arc::new(Metrics::new().unwrap());
        let service = service(carts).with_metrics(metrics.clone());

        service.fetch_cart("u1").await.unwrap();

        let encoded = metrics.encode().unwrap();
        assert!(encoded.contains("fallback_resolutions_total{resource=\"cart\",source=\"static\"} 1"));
        assert!(encoded.contains("cart_events_published_total{cause=\"load\"} 1"));
        assert!(encoded.contains("cart_operations_total{operation=\"fetch_cart\",status=\"success\"} 1"));
    }
}
