// Repositories module - backend data access layer

pub mod cart_repository;
pub mod http_backend;
pub mod payment_repository;
pub mod store_repository;

pub use cart_repository::CartRepository;
pub use http_backend::HttpBackend;
pub use payment_repository::PaymentRepository;
pub use store_repository::StoreRepository;
