// Services module - business logic layer

pub mod cart_service;
pub mod event_bus;
pub mod fallback;
pub mod user_locks;

pub use cart_service::CartService;
pub use event_bus::{CartEventBus, CartSubscription};
pub use fallback::{resolve, Resolved, Source};
pub use user_locks::UserLocks;
