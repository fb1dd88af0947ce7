#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use panier_rs::config::{BackendConfig, EventsConfig};
use panier_rs::handlers::create_api_router;
use panier_rs::repositories::HttpBackend;
use panier_rs::CartService;

/// A wiremock cart backend plus a gateway served on a random local port
pub struct TestEnvironment {
    pub backend: MockServer,
    pub service: Arc<CartService>,
    pub client: Client,
    pub base_url: String,
}

impl TestEnvironment {
    pub async fn new() -> Self {
        let backend = MockServer::start().await;
        let service = Arc::new(cart_service(&backend.uri()));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().expect("Failed to read local address");
        let app = create_api_router(service.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("Test server failed");
        });

        Self {
            backend,
            service,
            client: Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("Failed to build client"),
            base_url: format!("http://{}", addr),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// A service talking to `backend_url` with a short timeout
pub fn cart_service(backend_url: &str) -> CartService {
    let mut config = BackendConfig::new(backend_url);
    config.request_timeout_seconds = 2;
    let backend = Arc::new(HttpBackend::new(&config).expect("Failed to build backend client"));
    CartService::new(
        backend.clone(),
        backend.clone(),
        backend,
        &EventsConfig::default(),
    )
}

/// S1 sells bread at 2, one in the cart
pub fn bread_cart_json() -> Value {
    json!({
        "id": "C-1",
        "prix": 2.0,
        "magasins": [
            {
                "id": "S1",
                "nom": "Boulangerie",
                "produits": [
                    {"denomination": "bread", "prix": 2.0, "nb": 1, "image": "bread.png"}
                ]
            }
        ]
    })
}

pub fn static_cart_json() -> Value {
    json!({
        "prix": 1.0,
        "magasins": [
            {"id": "DEMO", "produits": [{"denomination": "demo", "prix": 1.0, "nb": 1}]}
        ]
    })
}

pub async fn mount_live_cart(server: &MockServer, user_id: &str, body: Value) {
    Mock::given(method("GET"))
        .and(path(format!("/api/getPanier/{}", user_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

pub async fn mount_static_cart(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/commande.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(static_cart_json()))
        .mount(server)
        .await;
}

/// `updatePanier` answering with the cart it was sent
pub async fn mount_echo_update(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/updatePanier/"))
        .respond_with(|request: &Request| {
            ResponseTemplate::new(200).set_body_bytes(request.body.clone())
        })
        .mount(server)
        .await;
}

/// `getPanier` and `updatePanier` sharing one stored cart, so every fetch sees
/// the last saved version
pub async fn mount_stored_cart(
    server: &MockServer,
    user_id: &str,
    initial: Value,
) -> Arc<Mutex<Value>> {
    let stored = Arc::new(Mutex::new(initial));

    let reader = stored.clone();
    Mock::given(method("GET"))
        .and(path(format!("/api/getPanier/{}", user_id)))
        .respond_with(move |_: &Request| {
            let cart = reader.lock().expect("Stored cart lock poisoned").clone();
            ResponseTemplate::new(200).set_body_json(cart)
        })
        .mount(server)
        .await;

    let writer = stored.clone();
    Mock::given(method("POST"))
        .and(path("/api/updatePanier/"))
        .respond_with(move |request: &Request| {
            let cart: Value =
                serde_json::from_slice(&request.body).expect("Request body is not JSON");
            *writer.lock().expect("Stored cart lock poisoned") = cart.clone();
            ResponseTemplate::new(200).set_body_json(cart)
        })
        .mount(server)
        .await;

    stored
}

/// Bodies the backend received on `path`
pub async fn received_bodies(server: &MockServer, route: &str) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|request| request.url.path() == route)
        .map(|request| serde_json::from_slice(&request.body).expect("Request body is not JSON"))
        .collect()
}
