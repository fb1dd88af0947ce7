use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A user's in-progress order ("commande"), as exchanged with the backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cart {
    /// Total price, recomputed from the line items before every backend update
    #[serde(rename = "prix", default, with = "rust_decimal::serde::float")]
    pub price: Decimal,
    #[serde(
        rename = "heureLivraison",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub delivery_time: Option<DeliveryTime>,
    #[serde(rename = "magasins", default)]
    pub stores: Vec<StoreOrder>,
    /// Backend attributes this service does not interpret, kept for round trips
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The part of a cart belonging to one vendor ("magasin")
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreOrder {
    pub id: String,
    #[serde(rename = "produits", default)]
    pub items: Vec<LineItem>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One product selection inside a store order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    /// Natural key of the product within its store
    pub denomination: String,
    #[serde(rename = "prix", default, with = "rust_decimal::serde::float")]
    pub unit_price: Decimal,
    #[serde(rename = "nb", default)]
    pub quantity: u32,
    /// UI-only state, never sent to the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<DisplayState>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Presentation state attached to products of a store listing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayState {
    pub is_buyed: bool,
}

/// Delivery time exactly as the backend wrote it.
///
/// Backends send RFC 3339 instants, naive timestamps or a bare hour such as
/// `"18:30"`. The text is kept verbatim so a cart round-trips unchanged;
/// [`DeliveryTime::to_utc`] reads it when it names an instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryTime(String);

impl DeliveryTime {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The instant this time designates; naive timestamps are taken as UTC
    pub fn to_utc(&self) -> Option<DateTime<Utc>> {
        if let Ok(instant) = DateTime::parse_from_rfc3339(&self.0) {
            return Some(instant.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&self.0, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

impl From<DateTime<Utc>> for DeliveryTime {
    fn from(instant: DateTime<Utc>) -> Self {
        Self(instant.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }
}

impl From<String> for DeliveryTime {
    fn from(text: String) -> Self {
        Self(text)
    }
}

impl Cart {
    /// Create an empty cart
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of `unit_price * quantity` over every store and line item
    pub fn computed_price(&self) -> Decimal {
        self.stores
            .iter()
            .flat_map(|store| store.items.iter())
            .map(LineItem::total_price)
            .sum()
    }

    /// Overwrite `price` with the value computed from the line items
    pub fn refresh_price(&mut self) {
        self.price = self.computed_price();
    }

    /// Total number of units across all stores
    pub fn total_items(&self) -> u32 {
        self.stores
            .iter()
            .flat_map(|store| store.items.iter())
            .map(|item| item.quantity)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.iter().all(|store| store.items.is_empty())
    }

    pub fn store(&self, store_id: &str) -> Option<&StoreOrder> {
        self.stores.iter().find(|store| store.id == store_id)
    }

    pub fn store_mut(&mut self, store_id: &str) -> Option<&mut StoreOrder> {
        self.stores.iter_mut().find(|store| store.id == store_id)
    }

    /// Look up a line item by store id and denomination
    pub fn item(&self, store_id: &str, denomination: &str) -> Option<&LineItem> {
        self.store(store_id)
            .and_then(|store| store.item(denomination))
    }

    /// Add `quantity` units of `item` sold by `store`.
    ///
    /// A missing store order is created from a copy of `store` with no items, and
    /// a missing line item from a copy of `item`. An existing line item has its
    /// quantity incremented. Returns the resulting line item.
    pub fn add_item(&mut self, store: &StoreOrder, item: &LineItem, quantity: u32) -> &LineItem {
        let index = match self.stores.iter().position(|order| order.id == store.id) {
            Some(index) => index,
            None => {
                let mut order = store.clone();
                order.items.clear();
                self.stores.push(order);
                self.stores.len() - 1
            }
        };

        self.stores[index].add_item(item, quantity)
    }

    /// Remove every line item with `denomination` from the store order `store_id`.
    ///
    /// Returns `None` when the store is not part of the cart, otherwise the
    /// removed line items (possibly none). The store order itself is kept.
    pub fn remove_item(&mut self, store_id: &str, denomination: &str) -> Option<Vec<LineItem>> {
        self.store_mut(store_id)
            .map(|store| store.remove_item(denomination))
    }

    /// Set the quantity of an existing line item; `None` if store or item is absent
    pub fn set_item_quantity(
        &mut self,
        store_id: &str,
        denomination: &str,
        quantity: u32,
    ) -> Option<&LineItem> {
        let item = self
            .store_mut(store_id)?
            .items
            .iter_mut()
            .find(|item| item.denomination == denomination)?;
        item.quantity = quantity;
        Some(&*item)
    }

    /// Copy of the cart as the backend expects it, without UI display state
    pub fn for_backend(&self) -> Cart {
        let mut cart = self.clone();
        for item in cart.stores.iter_mut().flat_map(|store| store.items.iter_mut()) {
            item.display = None;
        }
        cart
    }
}

impl StoreOrder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn item(&self, denomination: &str) -> Option<&LineItem> {
        self.items
            .iter()
            .find(|item| item.denomination == denomination)
    }

    fn add_item(&mut self, item: &LineItem, quantity: u32) -> &LineItem {
        let index = match self
            .items
            .iter()
            .position(|line| line.denomination == item.denomination)
        {
            Some(index) => {
                let line = &mut self.items[index];
                line.quantity = line.quantity.saturating_add(quantity);
                index
            }
            None => {
                let mut line = item.clone();
                line.quantity = quantity;
                self.items.push(line);
                self.items.len() - 1
            }
        };

        &self.items[index]
    }

    fn remove_item(&mut self, denomination: &str) -> Vec<LineItem> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|item| item.denomination == denomination);
        self.items = kept;
        removed
    }

    /// Reset the presentation state of every product to "not bought"
    pub fn reset_display_state(&mut self) {
        for item in &mut self.items {
            item.display = Some(DisplayState::default());
        }
    }
}

impl LineItem {
    pub fn new(denomination: impl Into<String>, unit_price: Decimal, quantity: u32) -> Self {
        Self {
            denomination: denomination.into(),
            unit_price,
            quantity,
            ..Self::default()
        }
    }

    /// `unit_price * quantity`
    pub fn total_price(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}
