use super::*;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use shared::domain::TempId;
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct ServerState {
    queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
    bodies: Arc<Mutex<Vec<Value>>>,
    auth: Arc<Mutex<Vec<String>>>,
}

fn post_json(id: &str, channel: &str, create_at: i64) -> Value {
    json!({
        "id": id,
        "create_at": create_at,
        "update_at": create_at,
        "user_id": "bob",
        "channel_id": channel,
        "message": format!("message {id}"),
    })
}

async fn channel_posts(
    State(state): State<ServerState>,
    Path(channel_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    state.queries.lock().push(query);
    Json(json!({
        "order": ["p2", "p1"],
        "posts": {
            "p1": post_json("p1", &channel_id, 1_700_000_000_000_i64),
            "p2": post_json("p2", &channel_id, 1_700_000_000_100_i64),
        },
        "next_post_id": "",
        "prev_post_id": "p0",
    }))
}

async fn team_channels(State(state): State<ServerState>, headers: HeaderMap) -> Json<Value> {
    if let Some(value) = headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok()) {
        state.auth.lock().push(value.to_string());
    }
    Json(json!([
        { "id": "c1", "team_id": "t1", "type": "O", "display_name": "Town Square", "total_msg_count": 10 },
        { "id": "c2", "team_id": "t1", "type": "P", "name": "secret", "total_msg_count": 4 },
    ]))
}

async fn single_channel(Path(channel_id): Path<String>) -> Json<Value> {
    Json(json!({ "id": channel_id, "team_id": "t1", "type": "O", "display_name": "Joined" }))
}

async fn team_members() -> Json<Value> {
    Json(json!([
        {
            "channel_id": "c1",
            "user_id": "alice",
            "last_viewed_at": 1_700_000_000_000_i64,
            "msg_count": 7,
            "mention_count": 2,
            "notify_props": { "mark_unread": "mention" }
        },
        { "channel_id": "c2", "user_id": "alice", "msg_count": 4 },
    ]))
}

async fn missing_thread() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "id": "app.post.get.app_error",
            "message": "Unable to get the post.",
            "status_code": 404
        })),
    )
}

async fn create_post(State(state): State<ServerState>, Json(body): Json<Value>) -> Json<Value> {
    state.bodies.lock().push(body.clone());
    let mut created = post_json("srv-1", body["channel_id"].as_str().unwrap_or_default(), 1_700_000_000_500_i64);
    created["pending_post_id"] = body["pending_post_id"].clone();
    created["message"] = body["message"].clone();
    Json(created)
}

async fn remove_reaction() -> StatusCode {
    StatusCode::SERVICE_UNAVAILABLE
}

async fn spawn_chat_server() -> Result<(String, ServerState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = ServerState::default();
    let app = Router::new()
        .route("/api/v4/channels/:channel_id", get(single_channel))
        .route("/api/v4/channels/:channel_id/posts", get(channel_posts))
        .route("/api/v4/users/me/teams/:team_id/channels", get(team_channels))
        .route("/api/v4/users/me/teams/:team_id/channels/members", get(team_members))
        .route("/api/v4/posts/:post_id/thread", get(missing_thread))
        .route("/api/v4/posts", post(create_post))
        .route(
            "/api/v4/users/:user_id/posts/:post_id/reactions/:emoji",
            delete(remove_reaction),
        )
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

fn api(base_url: &str) -> HttpChatApi {
    HttpChatApi::new(base_url, Some("token-1".to_string()), UserId::from("alice")).expect("api")
}

#[tokio::test]
async fn older_page_follows_server_order_and_cursor() -> Result<()> {
    let (base_url, state) = spawn_chat_server().await?;
    let api = api(&base_url);

    let page = api
        .fetch_older_posts(&ChannelId::from("c1"), Some(&PostId::from("p3")), 30)
        .await?;

    let ids = page
        .posts
        .iter()
        .map(|post| post.id.to_string())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["p2", "p1"]);
    assert!(page.has_more);
    let queries = state.queries.lock().clone();
    assert_eq!(queries[0].get("before").map(String::as_str), Some("p3"));
    assert_eq!(queries[0].get("per_page").map(String::as_str), Some("30"));
    assert!(!queries[0].contains_key("after"));
    Ok(())
}

#[tokio::test]
async fn team_channels_combine_member_counts() -> Result<()> {
    let (base_url, state) = spawn_chat_server().await?;
    let api = api(&base_url);

    let snapshots = api.fetch_team_channels(&TeamId::from("t1")).await?;

    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].counts, UnreadCounts::new(3, 2));
    assert!(snapshots[0].channel.muted);
    assert!(snapshots[0].channel.last_viewed_at.is_some());
    assert!(snapshots[0].channel.member_ids.contains(&UserId::from("alice")));
    assert_eq!(snapshots[1].channel.display_name, "secret");
    assert!(snapshots[1].counts.is_zero());
    assert_eq!(state.auth.lock().clone(), vec!["Bearer token-1".to_string()]);
    Ok(())
}

#[tokio::test]
async fn single_channel_includes_the_local_user() -> Result<()> {
    let (base_url, _state) = spawn_chat_server().await?;
    let api = api(&base_url);

    let channel = api.fetch_channel(&ChannelId::from("c7")).await?;

    assert_eq!(channel.id, ChannelId::from("c7"));
    assert_eq!(channel.team_id, Some(TeamId::from("t1")));
    assert_eq!(channel.display_name, "Joined");
    assert!(channel.member_ids.contains(&UserId::from("alice")));
    Ok(())
}

#[tokio::test]
async fn error_bodies_map_to_typed_errors() -> Result<()> {
    let (base_url, _state) = spawn_chat_server().await?;
    let api = api(&base_url);

    let err = api
        .fetch_thread(&PostId::from("gone"))
        .await
        .expect_err("missing thread");
    assert_eq!(err.code, ErrorCode::NotFound);
    assert_eq!(err.message, "Unable to get the post.");
    assert!(!err.is_transient());

    let err = api
        .remove_reaction(&Reaction::new("p1", "tada", "alice"))
        .await
        .expect_err("unavailable");
    assert_eq!(err.code, ErrorCode::Unavailable);
    assert!(err.is_transient());
    Ok(())
}

#[tokio::test]
async fn create_post_carries_pending_id() -> Result<()> {
    let (base_url, state) = spawn_chat_server().await?;
    let api = api(&base_url);
    let draft = PostDraft {
        temp_id: TempId::from("alice:abc"),
        channel_id: ChannelId::from("c1"),
        root_id: None,
        user_id: UserId::from("alice"),
        message: "hello".to_string(),
        file_ids: Vec::new(),
        created_at: Utc::now(),
    };

    let created = api.create_post(&draft).await?;

    assert_eq!(created.confirmed_id(), Some(&PostId::from("srv-1")));
    assert_eq!(created.pending_post_id, Some(TempId::from("alice:abc")));
    assert_eq!(created.message, "hello");
    let bodies = state.bodies.lock().clone();
    assert_eq!(bodies[0]["pending_post_id"], "alice:abc");
    assert_eq!(bodies[0]["root_id"], "");
    Ok(())
}

#[tokio::test]
async fn unreachable_server_is_transient() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");

    let err = api(&format!("http://{addr}"))
        .delete_post(&PostId::from("p1"))
        .await
        .expect_err("connection refused");
    assert_eq!(err.code, ErrorCode::Unavailable);
    Ok(())
}
