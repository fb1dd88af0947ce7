// Re-export all model types
pub use self::cart::*;
pub use self::errors::*;
pub use self::events::*;
pub use self::payment::*;

mod cart;
mod errors;
mod events;
mod payment;
