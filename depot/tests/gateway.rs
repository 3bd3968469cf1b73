//! HTTP behaviour of the gateway against in-process engines.

mod common;

use std::time::Duration;

use anyhow::Result;
use reqwest::StatusCode;

use common::{bind_api, member, serve, url, LocalEngine};
use depot::consensus::ConsensusEngine;
use depot::gateway::{GatewayConfig, FORWARDED_HEADER};

/// A leader and a follower that knows where the leader's API lives.
struct Pair {
    client: reqwest::Client,
    leader: std::sync::Arc<LocalEngine>,
    leader_api: std::net::SocketAddr,
    follower: std::sync::Arc<LocalEngine>,
    follower_api: std::net::SocketAddr,
}

async fn pair(follower_config: GatewayConfig) -> Pair {
    pair_with(GatewayConfig::default(), follower_config).await
}

async fn pair_with(leader_config: GatewayConfig, follower_config: GatewayConfig) -> Pair {
    let (leader_listener, leader_api) = bind_api().await;
    let leader_member = member(30401, Some(leader_api));
    let leader = LocalEngine::leader(leader_member.clone());
    serve(leader_listener, leader.clone(), leader_config);

    let (follower_listener, follower_api) = bind_api().await;
    let follower = LocalEngine::follower(member(30402, Some(follower_api)), Some(leader_member));
    serve(follower_listener, follower.clone(), follower_config);

    Pair {
        client: reqwest::Client::new(),
        leader,
        leader_api,
        follower,
        follower_api,
    }
}

#[tokio::test]
async fn write_on_follower_is_forwarded_to_leader() -> Result<()> {
    let pair = pair(GatewayConfig::default()).await;

    let response = pair
        .client
        .put(url(pair.follower_api, "/setKV"))
        .body(r#"{"a":"1","b":"2"}"#)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    assert_eq!(pair.leader.store().get("a").as_deref(), Some("1"));
    assert_eq!(pair.leader.store().get("b").as_deref(), Some("2"));
    // Only the leader's engine applied anything.
    assert!(pair.follower.store().is_empty());

    let value = pair
        .client
        .get(url(pair.leader_api, "/getKV/a"))
        .send()
        .await?;
    assert_eq!(value.status(), StatusCode::OK);
    assert_eq!(value.text().await?, "1");
    Ok(())
}

#[tokio::test]
async fn forwarded_and_direct_writes_converge() -> Result<()> {
    let pair = pair(GatewayConfig::default()).await;

    pair.client
        .put(url(pair.leader_api, "/setKV"))
        .body(r#"{"k":"direct"}"#)
        .send()
        .await?;
    let direct = pair.leader.store().snapshot();

    pair.client
        .put(url(pair.follower_api, "/setKV"))
        .body(r#"{"k":"direct"}"#)
        .send()
        .await?;
    assert_eq!(pair.leader.store().snapshot(), direct);
    Ok(())
}

#[tokio::test]
async fn delete_on_follower_is_forwarded_with_encoded_key() -> Result<()> {
    let pair = pair(GatewayConfig::default()).await;
    pair.client
        .put(url(pair.leader_api, "/setKV"))
        .body(r#"{"a b":"x","keep":"y"}"#)
        .send()
        .await?;

    let response = pair
        .client
        .delete(url(pair.follower_api, "/deleteKV/a%20b"))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(pair.leader.store().get("a b"), None);
    assert_eq!(pair.leader.store().get("keep").as_deref(), Some("y"));
    Ok(())
}

#[tokio::test]
async fn follower_without_forwarding_rejects_writes_untouched() -> Result<()> {
    let pair = pair(GatewayConfig {
        forward_writes: false,
        ..GatewayConfig::default()
    })
    .await;

    let set = pair
        .client
        .put(url(pair.follower_api, "/setKV"))
        .body(r#"{"a":"1"}"#)
        .send()
        .await?;
    assert_eq!(set.status(), StatusCode::BAD_REQUEST);
    assert_eq!(set.text().await?, "not the leader");

    let delete = pair
        .client
        .delete(url(pair.follower_api, "/deleteKV/a"))
        .send()
        .await?;
    assert_eq!(delete.status(), StatusCode::BAD_REQUEST);

    let remove = pair
        .client
        .delete(url(pair.follower_api, "/removeNode"))
        .body("127.0.0.1:30401")
        .send()
        .await?;
    assert_eq!(remove.status(), StatusCode::BAD_REQUEST);

    assert!(pair.follower.store().is_empty());
    assert!(pair.leader.store().is_empty());
    assert_eq!(pair.leader.status().members.len(), 1);
    Ok(())
}

#[tokio::test]
async fn follower_with_no_known_leader_returns_not_leader() -> Result<()> {
    let (listener, api) = bind_api().await;
    let orphan = LocalEngine::follower(member(30403, Some(api)), None);
    serve(listener, orphan.clone(), GatewayConfig::default());

    let response = reqwest::Client::new()
        .put(url(api, "/setKV"))
        .body(r#"{"a":"1"}"#)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(orphan.store().is_empty());
    Ok(())
}

#[tokio::test]
async fn already_forwarded_request_is_not_relayed_again() -> Result<()> {
    let pair = pair(GatewayConfig::default()).await;

    let response = pair
        .client
        .put(url(pair.follower_api, "/setKV"))
        .header(FORWARDED_HEADER, "1")
        .body(r#"{"a":"1"}"#)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(pair.leader.store().is_empty());
    Ok(())
}

#[tokio::test]
async fn leader_failure_is_relayed_verbatim() -> Result<()> {
    let pair = pair(GatewayConfig::default()).await;
    pair.leader.reject_proposals("disk full");

    let direct = pair
        .client
        .put(url(pair.leader_api, "/setKV"))
        .body(r#"{"a":"1"}"#)
        .send()
        .await?;
    let direct_status = direct.status();
    let direct_body = direct.text().await?;
    assert_eq!(direct_status, StatusCode::BAD_REQUEST);
    assert!(direct_body.contains("disk full"));

    let relayed = pair
        .client
        .put(url(pair.follower_api, "/setKV"))
        .body(r#"{"a":"1"}"#)
        .send()
        .await?;
    assert_eq!(relayed.status(), direct_status);
    assert_eq!(relayed.text().await?, direct_body);
    Ok(())
}

#[tokio::test]
async fn leader_commit_timeout_is_relayed_not_cut_short() -> Result<()> {
    let config = GatewayConfig {
        commit_timeout: Duration::from_millis(300),
        ..GatewayConfig::default()
    };
    let pair = pair_with(config.clone(), config).await;
    pair.leader.stall();

    let direct = pair
        .client
        .put(url(pair.leader_api, "/setKV"))
        .body(r#"{"a":"1"}"#)
        .send()
        .await?;
    let direct_body = direct.text().await?;
    assert!(direct_body.contains("may or may not"));

    let relayed = pair
        .client
        .put(url(pair.follower_api, "/setKV"))
        .body(r#"{"a":"1"}"#)
        .send()
        .await?;
    assert_eq!(relayed.status(), StatusCode::BAD_REQUEST);
    assert_eq!(relayed.text().await?, direct_body);
    Ok(())
}

#[tokio::test]
async fn leader_without_api_address_cannot_receive_forwarded_writes() -> Result<()> {
    let (listener, api) = bind_api().await;
    let bare_leader = member(30409, None);
    let follower = LocalEngine::follower(member(30410, Some(api)), Some(bare_leader));
    serve(listener, follower.clone(), GatewayConfig::default());

    let response = reqwest::Client::new()
        .put(url(api, "/setKV"))
        .body(r#"{"a":"1"}"#)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response.text().await?;
    assert!(body.contains("no API address"), "{body}");
    assert!(body.contains("127.0.0.1:30409="), "{body}");
    assert!(follower.store().is_empty());
    Ok(())
}

#[tokio::test]
async fn delete_of_absent_key_on_leader_succeeds() -> Result<()> {
    let (listener, api) = bind_api().await;
    let leader = LocalEngine::leader(member(30404, Some(api)));
    serve(listener, leader.clone(), GatewayConfig::default());

    let response = reqwest::Client::new()
        .delete(url(api, "/deleteKV/never-set"))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    Ok(())
}

#[tokio::test]
async fn get_returns_value_or_404() -> Result<()> {
    let (listener, api) = bind_api().await;
    let leader = LocalEngine::leader(member(30405, Some(api)));
    serve(listener, leader.clone(), GatewayConfig::default());
    let client = reqwest::Client::new();

    client
        .put(url(api, "/setKV"))
        .body(r#"{"present":"yes","empty":""}"#)
        .send()
        .await?;

    let present = client.get(url(api, "/getKV/present")).send().await?;
    assert_eq!(present.status(), StatusCode::OK);
    assert_eq!(present.text().await?, "yes");

    let empty = client.get(url(api, "/getKV/empty")).send().await?;
    assert_eq!(empty.status(), StatusCode::OK);
    assert_eq!(empty.text().await?, "");

    let missing = client.get(url(api, "/getKV/absent")).send().await?;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn malformed_body_is_rejected_before_proposing() -> Result<()> {
    let (listener, api) = bind_api().await;
    let leader = LocalEngine::leader(member(30406, Some(api)));
    serve(listener, leader.clone(), GatewayConfig::default());
    let client = reqwest::Client::new();

    for body in ["{not json", r#"["a","b"]"#, r#"{"a":1}"#] {
        let response = client.put(url(api, "/setKV")).body(body).send().await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {body}");
    }
    assert_eq!(leader.status().applied_index, 0);
    Ok(())
}

#[tokio::test]
async fn commit_timeout_reports_unknown_outcome() -> Result<()> {
    let (listener, api) = bind_api().await;
    let leader = LocalEngine::leader(member(30407, Some(api)));
    leader.stall();
    serve(
        listener,
        leader.clone(),
        GatewayConfig {
            commit_timeout: Duration::from_millis(50),
            ..GatewayConfig::default()
        },
    );

    let response = reqwest::Client::new()
        .put(url(api, "/setKV"))
        .body(r#"{"a":"1"}"#)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.text().await?.contains("may or may not"));
    Ok(())
}

#[tokio::test]
async fn halted_state_machine_answers_503() -> Result<()> {
    let (listener, api) = bind_api().await;
    let leader = LocalEngine::leader(member(30408, Some(api)));
    serve(listener, leader.clone(), GatewayConfig::default());
    leader.commit_raw(b"\x01 not a command");

    let response = reqwest::Client::new()
        .put(url(api, "/setKV"))
        .body(r#"{"a":"1"}"#)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(leader.store().is_empty());
    Ok(())
}

#[tokio::test]
async fn status_reports_role_and_leader() -> Result<()> {
    let pair = pair(GatewayConfig::default()).await;

    let status: serde_json::Value = pair
        .client
        .get(url(pair.follower_api, "/status"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(status["role"], "Follower");
    assert_eq!(status["leader_id"], pair.leader.status().id);
    assert_eq!(status["fsm_state"], "Ready");
    Ok(())
}
