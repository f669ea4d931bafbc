use std::sync::Arc;

use anyhow::Result;
use assert_json_diff::assert_json_include;
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::common::*;

use remote_config::redis::MockRedisClient;
use remote_config::storage::Storage;
use remote_config::test_utils::{experiment_with_variants, flow, random_string, MemoryStorage};

pub mod common;

async fn seeded_storage() -> Arc<MemoryStorage> {
    let storage = Arc::new(MemoryStorage::new());

    let mut base = flow("onboarding", "base", true);
    base.content = json!({"theme": "light", "steps": [1, 2, 3]});
    storage.insert_flow(base).await.unwrap();

    storage
        .push_flow_with_id(10, "onboarding", "variant-a", json!({"theme": "dark"}))
        .await;
    storage
        .push_flow_with_id(11, "onboarding", "variant-b", json!({"theme": "blue"}))
        .await;
    storage
        .push_experiment(experiment_with_variants(
            1,
            "onboarding",
            &[(10, 50), (11, 50)],
        ))
        .await;

    storage
}

fn config_payload(principal_id: &str) -> String {
    json!({
        "principal_id": principal_id,
        "type": "onboarding",
        "platform": "ios",
        "country": "US",
        "language": "en",
        "principal_created_at": "2024-03-15T12:00:00Z"
    })
    .to_string()
}

#[tokio::test]
async fn it_resolves_the_base_config() -> Result<()> {
    let storage = seeded_storage().await;
    let server =
        ServerHandle::for_backends(storage, Arc::new(MockRedisClient::new()), test_config()).await;

    // no targeting attributes: no experiment can match
    let payload = json!({
        "principal_id": "user-1",
        "type": "onboarding",
        "principal_created_at": "2024-03-15T12:00:00Z"
    });
    let res = server.post_json("/config", payload.to_string()).await;
    assert_eq!(StatusCode::OK, res.status());

    let json_data = res.json::<Value>().await?;
    assert_json_include!(
        actual: json_data,
        expected: json!({
            "success": true,
            "data": {"theme": "light", "steps": [1, 2, 3]},
            "meta": {"type": "onboarding", "has_experiment": false}
        })
    );
    Ok(())
}

#[tokio::test]
async fn it_assigns_an_experiment_flow_and_sticks_to_it() -> Result<()> {
    let storage = seeded_storage().await;
    let server =
        ServerHandle::for_backends(storage, Arc::new(MockRedisClient::new()), test_config()).await;

    let principal_id = random_string("user_", 16);
    let res = server.post_json("/config", config_payload(&principal_id)).await;
    assert_eq!(StatusCode::OK, res.status());

    let first = res.json::<Value>().await?;
    assert_eq!(first["meta"]["has_experiment"], json!(true));
    assert_eq!(first["meta"]["experiment_id"], json!(1));
    let flow_id = first["meta"]["flow_id"].clone();
    // one of the two variants, merged over the base
    assert!(first["data"]["theme"] == json!("dark") || first["data"]["theme"] == json!("blue"));
    assert_eq!(first["data"]["steps"], json!([1, 2, 3]));

    let res = server.post_json("/config", config_payload(&principal_id)).await;
    let second = res.json::<Value>().await?;
    assert_eq!(second["meta"]["flow_id"], flow_id);
    Ok(())
}

#[tokio::test]
async fn it_rejects_missing_principal_and_type() -> Result<()> {
    let storage = seeded_storage().await;
    let server =
        ServerHandle::for_backends(storage, Arc::new(MockRedisClient::new()), test_config()).await;

    let res = server
        .post_json("/config", json!({"type": "onboarding"}).to_string())
        .await;
    assert_eq!(StatusCode::BAD_REQUEST, res.status());

    let res = server
        .post_json("/config", json!({"principal_id": "user-1"}).to_string())
        .await;
    assert_eq!(StatusCode::BAD_REQUEST, res.status());
    Ok(())
}

#[tokio::test]
async fn it_rejects_non_json_content_types() -> Result<()> {
    let storage = seeded_storage().await;
    let server =
        ServerHandle::for_backends(storage, Arc::new(MockRedisClient::new()), test_config()).await;

    let res = server
        .send_invalid_header_request("/config", config_payload("user-1"))
        .await;
    assert_eq!(StatusCode::BAD_REQUEST, res.status());
    Ok(())
}

#[tokio::test]
async fn it_confirms_an_assignment_exactly_once() -> Result<()> {
    let storage = seeded_storage().await;
    let server =
        ServerHandle::for_backends(storage, Arc::new(MockRedisClient::new()), test_config()).await;

    let principal_id = random_string("user_", 16);
    let res = server.post_json("/config", config_payload(&principal_id)).await;
    let resolved = res.json::<Value>().await?;
    let experiment_id = resolved["meta"]["experiment_id"].clone();
    let flow_id = resolved["meta"]["flow_id"].clone();

    // a flow the principal was not assigned is rejected
    let res = server
        .post_json(
            "/config/confirm",
            json!({
                "principal_id": principal_id.as_str(),
                "experiment_id": experiment_id,
                "flow_id": 999
            })
            .to_string(),
        )
        .await;
    assert_eq!(StatusCode::CONFLICT, res.status());

    let payload = json!({
        "principal_id": principal_id.as_str(),
        "experiment_id": experiment_id,
        "flow_id": flow_id,
        "metadata": {"screen": "final"}
    })
    .to_string();

    let res = server.post_json("/config/confirm", payload.clone()).await;
    assert_eq!(StatusCode::OK, res.status());
    let confirmed = res.json::<Value>().await?;
    assert_eq!(confirmed["status"], json!("confirmed"));
    let confirmation_id = confirmed["confirmation_id"].clone();

    // confirming again returns the same row
    let res = server.post_json("/config/confirm", payload).await;
    assert_eq!(StatusCode::OK, res.status());
    let again = res.json::<Value>().await?;
    assert_eq!(again["confirmation_id"], confirmation_id);
    Ok(())
}

#[tokio::test]
async fn it_reports_experiment_stats() -> Result<()> {
    let storage = seeded_storage().await;
    let server =
        ServerHandle::for_backends(storage, Arc::new(MockRedisClient::new()), test_config()).await;

    for i in 0..4 {
        let res = server
            .post_json("/config", config_payload(&format!("user-{i}")))
            .await;
        assert_eq!(StatusCode::OK, res.status());
    }

    let res = server.get("/experiments/1/stats").await;
    assert_eq!(StatusCode::OK, res.status());
    let stats = res.json::<Value>().await?;
    assert_eq!(stats["experiment_id"], json!(1));
    assert_eq!(stats["total_assignments"], json!(4));
    // 50/50 convergent selection over 4 principals lands 2 and 2
    assert_json_include!(
        actual: stats,
        expected: json!({
            "flows": [
                {"flow_id": 10, "ratio": 50, "assigned_count": 2, "selection_count": 2},
                {"flow_id": 11, "ratio": 50, "assigned_count": 2, "selection_count": 2}
            ]
        })
    );

    let res = server.get("/experiments/42/stats").await;
    assert_eq!(StatusCode::NOT_FOUND, res.status());
    Ok(())
}

#[tokio::test]
async fn it_creates_definitions_and_enforces_write_time_invariants() -> Result<()> {
    let storage = seeded_storage().await;
    let server =
        ServerHandle::for_backends(storage, Arc::new(MockRedisClient::new()), test_config()).await;

    // a second default for the type is refused
    let res = server
        .post_json(
            "/flows",
            json!({
                "type": "onboarding",
                "name": "another-base",
                "content": {},
                "is_default": true
            })
            .to_string(),
        )
        .await;
    assert_eq!(StatusCode::CONFLICT, res.status());

    // so is a name already taken within the type
    let res = server
        .post_json(
            "/flows",
            json!({
                "type": "onboarding",
                "name": "base",
                "content": {},
                "is_default": false
            })
            .to_string(),
        )
        .await;
    assert_eq!(StatusCode::CONFLICT, res.status());

    // bad ratios are a caller error
    let res = server
        .post_json(
            "/experiments",
            json!({
                "name": "bad-ratios",
                "type": "onboarding",
                "platforms": ["android"],
                "countries": ["FR"],
                "languages": ["fr"],
                "variants": [{"flow_id": 10, "ratio": 60}, {"flow_id": 11, "ratio": 60}]
            })
            .to_string(),
        )
        .await;
    assert_eq!(StatusCode::BAD_REQUEST, res.status());

    // overlap guard: the seeded experiment already targets ios/US/en
    let res = server
        .post_json(
            "/experiments",
            json!({
                "name": "overlapping",
                "type": "onboarding",
                "platforms": ["ios", "android"],
                "countries": ["US"],
                "languages": ["en"],
                "variants": [{"flow_id": 10, "ratio": 50}, {"flow_id": 11, "ratio": 50}]
            })
            .to_string(),
        )
        .await;
    assert_eq!(StatusCode::BAD_REQUEST, res.status());

    // disjoint targeting is accepted
    let res = server
        .post_json(
            "/experiments",
            json!({
                "name": "acceptable",
                "type": "onboarding",
                "platforms": ["android"],
                "countries": ["FR"],
                "languages": ["fr"],
                "variants": [{"flow_id": 10, "ratio": 50}, {"flow_id": 11, "ratio": 50}]
            })
            .to_string(),
        )
        .await;
    assert_eq!(StatusCode::OK, res.status());
    Ok(())
}

#[tokio::test]
async fn a_locked_winner_overrides_the_experiment() -> Result<()> {
    let storage = seeded_storage().await;
    let server =
        ServerHandle::for_backends(storage, Arc::new(MockRedisClient::new()), test_config()).await;

    let winner = json!({
        "type": "onboarding",
        "platform": "ios",
        "country_code": "US",
        "language": "en",
        "content": {"theme": "winner"}
    })
    .to_string();
    let res = server.post_json("/winners", winner.clone()).await;
    assert_eq!(StatusCode::OK, res.status());

    // one winner per tuple
    let res = server.post_json("/winners", winner).await;
    assert_eq!(StatusCode::CONFLICT, res.status());

    let res = server.post_json("/config", config_payload("user-1")).await;
    let resolved = res.json::<Value>().await?;
    assert_eq!(resolved["data"]["theme"], json!("winner"));
    assert_eq!(resolved["meta"]["has_experiment"], json!(false));
    Ok(())
}

#[tokio::test]
async fn it_honors_a_test_override_for_the_calling_ip() -> Result<()> {
    let storage = seeded_storage().await;
    storage
        .push_flow_with_id(99, "onboarding", "qa-pin", json!({"theme": "qa"}))
        .await;
    let server =
        ServerHandle::for_backends(storage, Arc::new(MockRedisClient::new()), test_config()).await;

    let res = server
        .post_json(
            "/test-overrides",
            json!({"ip": "127.0.0.1", "type": "onboarding", "flow_id": 99}).to_string(),
        )
        .await;
    assert_eq!(StatusCode::OK, res.status());

    let res = server.post_json("/config", config_payload("user-1")).await;
    let resolved = res.json::<Value>().await?;
    assert_eq!(resolved["data"]["theme"], json!("qa"));
    assert_eq!(resolved["meta"]["has_experiment"], json!(false));

    // clearing the pin puts the principal back on the normal path
    let client = reqwest::Client::new();
    let res = client
        .delete(format!("http://{:?}/test-overrides", server.addr))
        .send()
        .await?;
    assert_eq!(StatusCode::OK, res.status());

    let res = server.post_json("/config", config_payload("user-1")).await;
    let resolved = res.json::<Value>().await?;
    assert_eq!(resolved["meta"]["has_experiment"], json!(true));
    Ok(())
}
