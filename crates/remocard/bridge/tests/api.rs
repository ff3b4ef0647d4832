//! HTTP surface, driven in-process

mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use common::{APPLET, ISD_R, TestBridge, aid, body_bytes, parse, two_readers};
use remocard_apdu_core::mock::MockService;
use remocard_bridge::handshake::{SESSION_CAPACITY, SessionKey};
use remocard_bridge::overlay::decrypt;
use remocard_bridge::{SESSION_HEADER, Settings};
use serde_json::json;

fn single_channel() -> Settings {
    Settings {
        single_channel: true,
        ..Settings::default()
    }
}

fn allow_only(reader: &str) -> Settings {
    Settings {
        allowed_readers: BTreeSet::from([reader.to_owned()]),
        ..Settings::default()
    }
}

async fn open(bridge: &TestBridge, reader: &str, aid: &str) {
    let (status, body) = bridge
        .post("/openChannel", json!({ "aids": [aid], "reader": reader }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn version_is_public_and_plaintext() {
    let bridge = TestBridge::protected(two_readers(), "pw");

    let response = bridge
        .call(Request::get("/").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = parse(&body_bytes(response).await);

    assert_eq!(body["version"], "1.2");
    assert_eq!(body["deviceName"], "RemoCard");
    assert_eq!(body["encryptionRequired"], true);
    assert_eq!(body["sessionSupported"], true);
}

#[tokio::test]
async fn handshake_then_encrypted_send_apdu() {
    let bridge = TestBridge::protected(two_readers(), "pw");

    let (status, handshake) = bridge
        .post("/handshake", json!({ "clientNonce": "abc123" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    let session = handshake["sessionId"].as_str().unwrap().to_owned();
    let server_nonce = handshake["serverNonce"].as_str().unwrap();
    assert_eq!(server_nonce.len(), 16);
    let key = SessionKey::derive("pw", "abc123", server_nonce);

    let (status, body) = bridge
        .sealed(
            Method::POST,
            "/openChannel",
            Some(&session),
            &key,
            Some(json!({ "aids": [APPLET], "reader": "SIM1" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true, "aid": APPLET, "reader": "SIM1" }));

    bridge
        .service
        .push_responses("SIM1", [[0x6F_u8, 0x00, 0x90, 0x00]]);
    let (status, body) = bridge
        .sealed(
            Method::POST,
            "/sendApdu",
            Some(&session),
            &key,
            Some(json!({ "apdu": "80CA0066", "aid": APPLET, "reader": "SIM1" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "6f009000");
    assert_eq!(
        bridge.service.sent("SIM1").last().unwrap(),
        &vec![0x80, 0xCA, 0x00, 0x66]
    );
}

#[tokio::test]
async fn password_key_without_handshake() {
    let bridge = TestBridge::protected(two_readers(), "pw");
    let key = SessionKey::from_password("pw");

    let (status, body) = bridge
        .sealed(
            Method::POST,
            "/openChannel",
            None,
            &key,
            Some(json!({ "aids": [APPLET] })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reader"], "SIM1");

    let (status, body) = bridge
        .sealed(Method::GET, "/listChannels", None, &key, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["channels"], json!([format!("SIM1:{APPLET}")]));
}

#[tokio::test]
async fn wrong_password_is_rejected_with_sealed_error() {
    let bridge = TestBridge::protected(two_readers(), "pw");

    let response = bridge
        .call(
            Request::get("/listChannels")
                .header(header::AUTHORIZATION, "Bearer nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let sealed = body_bytes(response).await;
    let body = parse(&decrypt(&SessionKey::from_password("pw"), &sealed).unwrap());
    assert_eq!(
        body,
        json!({ "error": "Invalid password", "code": "invalid_password" })
    );
}

#[tokio::test]
async fn handshake_requires_password() {
    let bridge = TestBridge::protected(two_readers(), "pw");

    let response = bridge
        .call(
            Request::post("/handshake")
                .body(Body::from(r#"{"clientNonce":"abc"}"#))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(bridge.state.keys().is_empty());
}

#[tokio::test]
async fn unknown_session_is_plaintext_unauthorized() {
    let bridge = TestBridge::protected(two_readers(), "pw");

    // Rejected while sealing the reply
    let response = bridge
        .call(
            Request::get("/listChannels")
                .header(header::AUTHORIZATION, "Bearer pw")
                .header(SESSION_HEADER, "bogus")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = parse(&body_bytes(response).await);
    assert_eq!(body["code"], "invalid_session");

    // Rejected while opening the request
    let response = bridge
        .call(
            Request::post("/openChannel")
                .header(header::AUTHORIZATION, "Bearer pw")
                .header(SESSION_HEADER, "bogus")
                .body(Body::from("AAAA"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = parse(&body_bytes(response).await);
    assert_eq!(body["code"], "invalid_session");
    assert_eq!(bridge.service.sessions_opened("SIM1"), 0);
}

#[tokio::test]
async fn undecryptable_body_is_bad_request() {
    let bridge = TestBridge::protected(two_readers(), "pw");

    let response = bridge
        .call(
            Request::post("/openChannel")
                .header(header::AUTHORIZATION, "Bearer pw")
                .body(Body::from(r#"{"aids":[]}"#))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = parse(&body_bytes(response).await);
    assert_eq!(body["code"], "encryption_failed");
}

#[tokio::test]
async fn oldest_handshake_is_evicted() {
    let bridge = TestBridge::protected(two_readers(), "pw");

    let mut sessions = Vec::new();
    for n in 0..=SESSION_CAPACITY {
        let nonce = format!("n{n}");
        let (status, body) = bridge
            .post("/handshake", json!({ "clientNonce": nonce }))
            .await;
        assert_eq!(status, StatusCode::OK);
        let key = SessionKey::derive("pw", &nonce, body["serverNonce"].as_str().unwrap());
        sessions.push((body["sessionId"].as_str().unwrap().to_owned(), key));
    }
    assert_eq!(bridge.state.keys().len(), SESSION_CAPACITY);

    let (first, _) = &sessions[0];
    let response = bridge
        .call(
            Request::get("/listChannels")
                .header(header::AUTHORIZATION, "Bearer pw")
                .header(SESSION_HEADER, first.as_str())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let (second, key) = &sessions[1];
    let (status, body) = bridge
        .sealed(Method::GET, "/listChannels", Some(second), key, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["channels"], json!([]));
}

#[tokio::test]
async fn single_channel_mode_keeps_one_channel() {
    let bridge = TestBridge::new(two_readers(), single_channel());

    open(&bridge, "SIM1", APPLET).await;
    open(&bridge, "SIM2", APPLET).await;

    let (_, body) = bridge.get("/listChannels").await;
    assert_eq!(body["channels"], json!([format!("SIM2:{APPLET}")]));
    assert_eq!(bridge.service.open_channels("SIM1"), 0);
    assert_eq!(bridge.service.open_channels("SIM2"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_single_channel_opens_leave_one_channel() {
    let bridge = TestBridge::new(
        two_readers().with_latency(Duration::from_millis(5)),
        single_channel(),
    );

    for _ in 0..10 {
        let calls = ["SIM1", "SIM2", "SIM1", "SIM2"].map(|reader| {
            bridge.post("/openChannel", json!({ "aids": [APPLET], "reader": reader }))
        });
        for (status, body) in futures::future::join_all(calls).await {
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["success"], true);
        }

        let (_, body) = bridge.get("/listChannels").await;
        assert_eq!(body["channels"].as_array().unwrap().len(), 1);
        assert_eq!(
            bridge.service.open_channels("SIM1") + bridge.service.open_channels("SIM2"),
            1
        );
    }
}

#[tokio::test]
async fn multi_channel_mode_keeps_all_channels() {
    let bridge = TestBridge::open(two_readers());

    open(&bridge, "SIM1", APPLET).await;
    open(&bridge, "SIM1", ISD_R).await;
    open(&bridge, "SIM2", APPLET).await;
    // Same key again replaces the entry
    open(&bridge, "SIM2", APPLET).await;

    let (_, body) = bridge.get("/listChannels").await;
    assert_eq!(body["channels"].as_array().unwrap().len(), 3);
    assert_eq!(bridge.service.open_channels("SIM2"), 1);
}

#[tokio::test]
async fn unselectable_aids_report_failure() {
    let bridge = TestBridge::open(two_readers());

    let (status, body) = bridge
        .post("/openChannel", json!({ "aids": ["F0010203"], "reader": "SIM1" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": false }));
}

#[tokio::test]
async fn wrong_length_is_corrected_once() {
    let bridge = TestBridge::open(two_readers());
    open(&bridge, "SIM1", APPLET).await;

    bridge.service.push_responses(
        "SIM1",
        [vec![0x6C, 0x04], vec![0x01, 0x02, 0x03, 0x04, 0x90, 0x00]],
    );
    let (status, body) = bridge
        .post(
            "/sendApdu",
            json!({ "apdu": "00B00000", "aid": APPLET, "reader": "SIM1" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "010203049000");

    let sent = bridge.service.sent("SIM1");
    assert_eq!(
        sent,
        vec![vec![0x00, 0xB0, 0x00, 0x00], vec![0x00, 0xB0, 0x00, 0x00, 0x04]]
    );
}

#[tokio::test]
async fn chained_response_is_reassembled() {
    let bridge = TestBridge::open(two_readers());
    open(&bridge, "SIM1", APPLET).await;

    bridge.service.push_responses(
        "SIM1",
        [vec![0xAA, 0x61, 0x02], vec![0xBB, 0xCC, 0x90, 0x00]],
    );
    let (status, body) = bridge
        .post(
            "/sendApdu",
            json!({ "apdu": "80 ca 00 66 00", "aid": APPLET.to_lowercase(), "reader": "SIM1" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "aabbcc9000");
    assert_eq!(
        bridge.service.sent("SIM1").last().unwrap(),
        &vec![0x00, 0xC0, 0x00, 0x00, 0x02]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chained_exchanges_on_one_channel_do_not_interleave() {
    let bridge = TestBridge::open(two_readers().with_latency(Duration::from_millis(5)));
    open(&bridge, "SIM1", APPLET).await;

    bridge.service.push_responses(
        "SIM1",
        [
            vec![0xAA, 0x61, 0x01],
            vec![0xBB, 0x90, 0x00],
            vec![0xCC, 0x61, 0x01],
            vec![0xDD, 0x90, 0x00],
        ],
    );
    let request = json!({ "apdu": "80CA006600", "aid": APPLET, "reader": "SIM1" });
    let (first, second) = tokio::join!(
        bridge.post("/sendApdu", request.clone()),
        bridge.post("/sendApdu", request),
    );

    assert_eq!(first.0, StatusCode::OK);
    assert_eq!(second.0, StatusCode::OK);
    let mut responses = vec![
        first.1["response"].as_str().unwrap().to_owned(),
        second.1["response"].as_str().unwrap().to_owned(),
    ];
    responses.sort();
    assert_eq!(responses, ["aabb9000", "ccdd9000"]);

    let command = aid("80CA006600");
    let get_response = vec![0x00, 0xC0, 0x00, 0x00, 0x01];
    assert_eq!(
        bridge.service.sent("SIM1"),
        vec![command.clone(), get_response.clone(), command, get_response]
    );
}

#[tokio::test]
async fn send_apdu_requires_open_channel() {
    let bridge = TestBridge::open(two_readers());

    let (status, body) = bridge
        .post(
            "/sendApdu",
            json!({ "apdu": "00A4040000", "aid": APPLET, "reader": "SIM1" }),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("Call openChannel first"));
    assert_eq!(bridge.service.sessions_opened("SIM1"), 0);
}

#[tokio::test]
async fn malformed_requests_are_bad_requests() {
    let bridge = TestBridge::open(two_readers());
    open(&bridge, "SIM1", APPLET).await;

    let (status, _) = bridge
        .post(
            "/sendApdu",
            json!({ "apdu": "zz", "aid": APPLET, "reader": "SIM1" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = bridge
        .post("/openChannel", json!({ "aids": ["A0 0G"] }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let response = bridge
        .call(
            Request::post("/openChannel")
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn allow_list_denies_other_readers() {
    let bridge = TestBridge::new(two_readers(), allow_only("SIM2"));

    let (status, body) = bridge
        .post("/openChannel", json!({ "aids": [APPLET], "reader": "SIM1" }))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "access_denied");

    // The default reader is SIM1
    let (status, _) = bridge.post("/openChannel", json!({ "aids": [APPLET] })).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = bridge
        .post(
            "/sendApdu",
            json!({ "apdu": "00", "aid": APPLET, "reader": "SIM1" }),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = bridge
        .post("/sendRawApdu", json!({ "apdu": "00B00000", "reader": "SIM1" }))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = bridge
        .post("/closeChannel", json!({ "aids": [APPLET], "reader": "SIM1" }))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, body) = bridge.get("/listSlots").await;
    assert_eq!(body["slots"], json!([{ "name": "SIM2", "isPresent": true }]));

    open(&bridge, "SIM2", APPLET).await;
    assert_eq!(bridge.service.sessions_opened("SIM1"), 0);
}

#[tokio::test]
async fn allow_list_applies_before_credentials_matter() {
    let bridge = TestBridge::new(
        two_readers(),
        Settings {
            password: "pw".into(),
            ..allow_only("SIM2")
        },
    );
    let key = SessionKey::from_password("pw");

    let (status, body) = bridge
        .sealed(
            Method::POST,
            "/openChannel",
            None,
            &key,
            Some(json!({ "aids": [APPLET], "reader": "SIM9" })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "access_denied");
}

#[tokio::test]
async fn unknown_reader_is_not_found() {
    let bridge = TestBridge::open(two_readers());

    let (status, _) = bridge
        .post("/openChannel", json!({ "aids": [APPLET], "reader": "SIM9" }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let bridge = TestBridge::open(MockService::new());
    let (status, _) = bridge.post("/openChannel", json!({ "aids": [APPLET] })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = bridge.post("/sendRawApdu", json!({ "apdu": "00B00000" })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, body) = bridge.get("/listSlots").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["slots"], json!([]));
}

#[tokio::test]
async fn send_raw_apdu_uses_a_throwaway_channel() {
    let bridge = TestBridge::open(two_readers());
    bridge
        .service
        .push_responses("SIM2", [[0xBF_u8, 0x3E, 0x00, 0x90, 0x00]]);

    let (status, body) = bridge
        .post(
            "/sendRawApdu",
            json!({ "apdu": "80E2910006BF3E035C015A", "reader": "SIM2" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "bf3e009000");
    assert_eq!(
        bridge.service.sent("SIM2"),
        vec![aid("80E2910006BF3E035C015A")]
    );
    assert_eq!(bridge.service.open_channels("SIM2"), 0);

    let (_, body) = bridge.get("/listChannels").await;
    assert_eq!(body["channels"], json!([]));
}

#[tokio::test]
async fn send_raw_apdu_without_isd_r_fails() {
    let bridge = TestBridge::open(MockService::new().with_reader("SIM1"));

    let (status, body) = bridge
        .post("/sendRawApdu", json!({ "apdu": "00B00000" }))
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains(ISD_R));
}

#[tokio::test]
async fn close_channel_is_idempotent() {
    let bridge = TestBridge::open(two_readers());
    open(&bridge, "SIM1", APPLET).await;

    for _ in 0..2 {
        let (status, body) = bridge
            .post("/closeChannel", json!({ "aids": [APPLET], "reader": "SIM1" }))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true }));
    }

    let (_, body) = bridge.get("/listChannels").await;
    assert_eq!(body["channels"], json!([]));
    assert_eq!(bridge.service.open_channels("SIM1"), 0);
}

#[tokio::test]
async fn list_slots_reports_detected_eid() {
    let eid = "89049032123451234512345678901234";
    let mut response = aid("BF3E125A10");
    response.extend(aid(eid));
    response.extend([0x90, 0x00]);

    let service = MockService::new()
        .with_reader("SIM1")
        .with_empty_reader("SIM2")
        .with_applet("SIM1", &aid(ISD_R))
        .with_responses("SIM1", [response]);
    let bridge = TestBridge::open(service);
    bridge.state.refresh_slots();

    let (status, body) = bridge.get("/listSlots").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["slots"],
        json!([
            { "name": "SIM1", "isPresent": true, "eid": eid, "aid": ISD_R },
            { "name": "SIM2", "isPresent": false },
        ])
    );
}

#[tokio::test]
async fn update_settings_persists_and_applies() {
    let bridge = TestBridge::open(two_readers());

    let (status, body) = bridge
        .post(
            "/updateSettings",
            json!({ "port": 4000, "singleChannel": true, "allowedReaders": ["SIM2"] }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["message"],
        "Settings updated. Port change requires server restart."
    );

    let settings = bridge.state.settings().snapshot();
    assert_eq!(settings.port, 4000);
    assert!(settings.single_channel);
    let persisted = std::fs::read_to_string(bridge.settings_path()).unwrap();
    assert!(persisted.contains("port = 4000"));

    let (status, _) = bridge
        .post("/openChannel", json!({ "aids": [APPLET], "reader": "SIM1" }))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn setting_a_password_locks_the_bridge() {
    let bridge = TestBridge::open(two_readers());

    let (status, _) = bridge
        .post("/updateSettings", json!({ "password": "pw" }))
        .await;
    assert_eq!(status, StatusCode::OK);

    let response = bridge
        .call(Request::get("/listChannels").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let (status, body) = bridge
        .sealed(
            Method::GET,
            "/listChannels",
            None,
            &SessionKey::from_password("pw"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["channels"], json!([]));
}

#[tokio::test]
async fn cors_preflight() {
    let bridge = TestBridge::protected(two_readers(), "pw");

    let response = bridge
        .call(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/sendApdu")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "*"
    );
    assert!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_HEADERS]
            .to_str()
            .unwrap()
            .contains("X-Remo-Session")
    );
    // Preflights count as client activity too
    assert_eq!(bridge.state.activity().active(), vec!["unknown".to_owned()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn channels_are_used_concurrently() {
    let bridge = TestBridge::open(two_readers());
    open(&bridge, "SIM1", APPLET).await;
    open(&bridge, "SIM2", APPLET).await;

    let calls = (0..8).map(|n| {
        let reader = if n % 2 == 0 { "SIM1" } else { "SIM2" };
        bridge.post(
            "/sendApdu",
            json!({ "apdu": "00B0000000", "aid": APPLET, "reader": reader }),
        )
    });
    for (status, body) in futures::future::join_all(calls).await {
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"], "9000");
    }
    assert_eq!(bridge.service.sent("SIM1").len(), 4);
    assert_eq!(bridge.service.sent("SIM2").len(), 4);
}
