//! Shared setup for discharge-service integration tests.
//!
//! Each `TestApp` runs its own server on an ephemeral port with an
//! in-memory identity store and its own provider set.

#![allow(dead_code)]

use discharge_service::{
    build_router,
    config::ProviderConfig,
    models::Macaroon,
    services::{Bakery, Discharger, MemoryIdentityStore, ProviderRegistry, SessionTracker},
    visitor::{DischargeClient, Interactor, MultiVisitor},
    AppState,
};
use ed25519_dalek::SigningKey;
use service_core::middleware::create_login_rate_limiter;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

pub const SHARED_KEY: [u8; 32] = [0x5a; 32];

/// Argon2 hash of "testpassword".
pub const TESTPASSWORD_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$WneQEIkRYniJO4nwsVJCMg$gWszHTEUAHnVkdNyTnD4IkuZEC9CNR6VD2fSbYVDsuA";
/// Argon2 hash of "otherpassword".
pub const OTHERPASSWORD_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$l9vJgGVHGPyWZO2oece7hg$TLZFkELq/pRXNHSlSXmNEIe6KXsMAA5zJHikjO83mFc";

pub fn admin_key() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

/// Two static providers (one domain-qualified) and an agent provider that
/// trusts `admin_key()`.
pub fn default_providers() -> Vec<ProviderConfig> {
    let admin = discharge_service::utils::signature::encode_public_key(&admin_key().verifying_key());
    serde_json::from_value(serde_json::json!([
        {
            "type": "static",
            "name": "test",
            "users": {
                "test": {
                    "password_hash": TESTPASSWORD_HASH,
                    "name": "Test User",
                    "email": "test@example.com",
                    "groups": ["test1", "test2"]
                },
                "other": {
                    "password_hash": OTHERPASSWORD_HASH,
                    "groups": ["test3"]
                }
            }
        },
        {
            "type": "static",
            "name": "test2",
            "domain": "test2",
            "users": {
                "test": { "password_hash": TESTPASSWORD_HASH, "groups": ["test3"] }
            }
        },
        {
            "type": "agent",
            "name": "agent",
            "admin_public_key": admin
        }
    ]))
    .expect("valid provider config")
}

pub struct TestApp {
    pub location: String,
    pub store: Arc<MemoryIdentityStore>,
    pub sessions: Arc<SessionTracker>,
    pub http: reqwest::Client,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(default_providers()).await
    }

    pub async fn spawn_with(providers: Vec<ProviderConfig>) -> Self {
        // Bind first: visit and wait URLs are built from the real address.
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let location = format!("http://{}", listener.local_addr().unwrap());

        let http = reqwest::Client::new();
        let registry =
            ProviderRegistry::from_config(&providers, http.clone()).expect("Failed to build registry");
        let store = Arc::new(MemoryIdentityStore::new());
        let sessions = Arc::new(SessionTracker::new(Duration::from_secs(600)));
        let bakery = Bakery::new(location.clone(), SHARED_KEY.to_vec(), Duration::from_secs(3600));

        let discharger = Discharger::new(
            location.clone(),
            registry,
            store.clone(),
            sessions.clone(),
            Arc::new(bakery),
            Duration::from_secs(5),
        );

        let state = AppState {
            service_name: "discharge-service-test".to_string(),
            discharger: Arc::new(discharger),
            metrics: None,
            login_rate_limiter: create_login_rate_limiter(1000, 60),
            allowed_origins: vec![location.clone()],
        };
        let app = build_router(state).expect("Failed to build router");

        tokio::spawn(async move {
            service_core::axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        Self {
            location,
            store,
            sessions,
            http,
        }
    }

    /// A caveat id the way a relying party would seal it.
    pub fn caveat(&self, condition: &str) -> Vec<u8> {
        Bakery::seal_caveat(&SHARED_KEY, condition)
    }

    pub fn client(&self, interactors: Vec<Box<dyn Interactor>>) -> DischargeClient {
        DischargeClient::new(self.http.clone(), self.location.clone(), MultiVisitor::new(interactors))
    }

    /// Check the discharge was minted for `caveat_id` by this discharger.
    pub fn assert_discharges(&self, caveat_id: &[u8], macaroon: &Macaroon) {
        let root_key = Bakery::discharge_root_key(&SHARED_KEY, caveat_id);
        assert!(macaroon.verify(&root_key), "discharge signature does not verify");
        assert_eq!(macaroon.identifier, caveat_id);
        assert_eq!(macaroon.location, self.location);
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.location, path)
    }
}
