use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::models::{Cart, CartChangeEvent, ChangeCause};

/// Holds the current cart and fans every change out to subscribers.
///
/// Publishing swaps the current cart before the event is sent, under the same
/// write lock, so readers never observe an event ahead of the cart it carries
/// and subscribers receive events in publish order.
pub struct CartEventBus {
    current: RwLock<Option<Cart>>,
    sender: broadcast::Sender<CartChangeEvent>,
}

impl CartEventBus {
    /// `capacity` bounds how far a subscriber may lag before it skips events
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            current: RwLock::new(None),
            sender,
        }
    }

    /// Make `cart` the current cart and notify subscribers
    pub fn publish(&self, cart: Cart, cause: ChangeCause) -> CartChangeEvent {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let previous = current.replace(cart.clone());
        let event = CartChangeEvent::new(previous, cart, cause);

        // An error only means nobody is listening right now
        match self.sender.send(event.clone()) {
            Ok(receivers) => debug!(receivers, cause = %event.cause.name, "Cart event delivered"),
            Err(_) => debug!(cause = %event.cause.name, "Cart event published without subscribers"),
        }
        drop(current);

        info!(
            cause = %event.cause.name,
            stores = event.current.stores.len(),
            price = %event.current.price,
            "Cart changed"
        );
        event
    }

    /// The last published cart, if any
    pub fn current(&self) -> Option<Cart> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Edit the current cart in place without publishing. Returns `false` when
    /// there is no current cart.
    pub fn edit_current<F>(&self, edit: F) -> bool
    where
        F: FnOnce(&mut Cart),
    {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        match current.as_mut() {
            Some(cart) => {
                edit(cart);
                true
            }
            None => false,
        }
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> CartSubscription {
        CartSubscription {
            receiver: self.sender.subscribe(),
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A stream of cart change events
pub struct CartSubscription {
    receiver: broadcast::Receiver<CartChangeEvent>,
}

impl CartSubscription {
    /// Next event, or `None` once the bus is gone. Events this subscriber fell
    /// too far behind on are skipped.
    pub async fn recv(&mut self) -> Option<CartChangeEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Cart subscriber lagging, skipped events");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<CartChangeEvent> {
        use tokio::sync::broadcast::error::TryRecvError;

        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Cart subscriber lagging, skipped events");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}
