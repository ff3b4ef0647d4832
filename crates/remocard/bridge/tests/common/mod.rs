//! Common test utilities
#![allow(dead_code, unreachable_pub)]

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{Method, Request, Response, StatusCode, header};
use remocard_apdu_core::decode_hex;
use remocard_apdu_core::mock::MockService;
use remocard_bridge::config::Overrides;
use remocard_bridge::handshake::SessionKey;
use remocard_bridge::overlay::{decrypt, encrypt};
use remocard_bridge::{AppState, SESSION_HEADER, Settings, SettingsStore, router};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

/// ISD-R, the application `/sendRawApdu` talks to
pub const ISD_R: &str = "A0000005591010FFFFFFFF8900000100";
/// Some other selectable application
pub const APPLET: &str = "A0000000041010";

/// Mock service with two readers that both host [`ISD_R`] and [`APPLET`]
pub fn two_readers() -> MockService {
    MockService::new()
        .with_reader("SIM1")
        .with_reader("SIM2")
        .with_applet("SIM1", &aid(ISD_R))
        .with_applet("SIM1", &aid(APPLET))
        .with_applet("SIM2", &aid(ISD_R))
        .with_applet("SIM2", &aid(APPLET))
}

pub fn aid(hex: &str) -> Vec<u8> {
    decode_hex(hex).unwrap()
}

/// A bridge over a mock service with settings persisted in a temp dir
pub struct TestBridge {
    pub service: MockService,
    pub state: AppState,
    router: Router,
    dir: TempDir,
}

impl TestBridge {
    pub fn new(service: MockService, settings: Settings) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store =
            SettingsStore::with_settings(dir.path().join("remocard.toml"), Overrides::default(), settings);
        let state = AppState::new(Arc::new(service.clone()), store);
        Self {
            service,
            router: router(state.clone()),
            state,
            dir,
        }
    }

    /// Bridge without a password
    pub fn open(service: MockService) -> Self {
        Self::new(service, Settings::default())
    }

    /// Bridge requiring `password`
    pub fn protected(service: MockService, password: &str) -> Self {
        Self::new(
            service,
            Settings {
                password: password.to_owned(),
                ..Settings::default()
            },
        )
    }

    pub fn settings_path(&self) -> PathBuf {
        self.dir.path().join("remocard.toml")
    }

    fn password(&self) -> String {
        self.state.settings().snapshot().password.clone()
    }

    pub async fn call(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Plain JSON call, authenticated when a password is set
    pub async fn json(&self, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(path);
        let password = self.password();
        if !password.is_empty() {
            request = request.header(header::AUTHORIZATION, format!("Bearer {password}"));
        }
        let body = body.map_or_else(Body::empty, |value| Body::from(value.to_string()));

        let response = self.call(request.body(body).unwrap()).await;
        let status = response.status();
        (status, parse(&body_bytes(response).await))
    }

    pub async fn get(&self, path: &str) -> (StatusCode, Value) {
        self.json(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        self.json(Method::POST, path, Some(body)).await
    }

    /// Sealed call: the body is encrypted with `key` and the reply decrypted
    /// with it
    pub async fn sealed(
        &self,
        method: Method,
        path: &str,
        session: Option<&str>,
        key: &SessionKey,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .method(method)
            .uri(path)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.password()));
        if let Some(session) = session {
            request = request.header(SESSION_HEADER, session);
        }
        let body = body.map_or_else(Body::empty, |value| {
            Body::from(encrypt(key, value.to_string().as_bytes()).unwrap())
        });

        let response = self.call(request.body(body).unwrap()).await;
        let status = response.status();
        let bytes = body_bytes(response).await;
        let plain = decrypt(key, &bytes).unwrap();
        (status, parse(&plain))
    }
}

pub async fn body_bytes(response: Response<Body>) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

pub fn parse(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(bytes).unwrap()
    }
}
