// REST surface for threads and messages.
//
// Every mutation commits to the store first and then announces the change
// to the thread's room. The HTTP response reflects only the store outcome;
// notification problems are logged and never reach the client.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    routing::{delete, get, post},
    Json, Router,
};
use globechat_common::{
    protocol::ws::Notification,
    types::{Author, Message, MessageId, RoomId, Thread},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::{
    error::{ErrorCode, RelayError},
    rooms::NotificationDispatcher,
    store::{ChatStore, NewMessage, NewThread},
};

#[derive(Clone)]
struct ApiState {
    store: Arc<ChatStore>,
    dispatcher: NotificationDispatcher,
}

#[derive(Debug, Deserialize)]
struct CreateThreadRequest {
    lat: f64,
    long: f64,
    message: String,
    #[serde(flatten)]
    author: Author,
}

#[derive(Debug, Deserialize)]
struct CreateMessageRequest {
    thread_id: RoomId,
    #[serde(default)]
    text: String,
    #[serde(default)]
    image: String,
    #[serde(flatten)]
    author: Author,
}

#[derive(Debug, Serialize)]
struct ThreadEnvelope {
    thread: Thread,
}

#[derive(Debug, Serialize)]
struct MessageEnvelope {
    message: Message,
}

#[derive(Debug, Serialize)]
struct MessagesEnvelope {
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct StatusEnvelope {
    message: &'static str,
}

pub fn router(store: Arc<ChatStore>, dispatcher: NotificationDispatcher) -> Router {
    Router::new()
        .route("/v1/threads", post(create_thread))
        .route("/v1/threads/{thread_id}", delete(delete_thread))
        .route("/v1/threads/{thread_id}/messages", get(list_messages))
        .route("/v1/messages", post(create_message))
        .route("/v1/messages/{message_id}", delete(delete_message))
        .route("/v1/messages/{message_id}/report", post(report_message))
        .with_state(ApiState { store, dispatcher })
}

async fn create_thread(
    State(state): State<ApiState>,
    payload: Result<Json<CreateThreadRequest>, JsonRejection>,
) -> Result<Json<ThreadEnvelope>, RelayError> {
    let Json(payload) = payload.map_err(rejection_to_error)?;
    validate_coordinates(payload.lat, payload.long)?;

    let thread = state
        .store
        .create_thread(NewThread {
            lat: payload.lat,
            long: payload.long,
            message: payload.message,
            author: payload.author,
        })
        .await?;

    debug!(thread_id = thread.id, user_id = thread.user_id, "thread created");
    Ok(Json(ThreadEnvelope { thread }))
}

async fn list_messages(
    State(state): State<ApiState>,
    Path(thread_id): Path<RoomId>,
) -> Result<Json<MessagesEnvelope>, RelayError> {
    let messages = state.store.messages_for_thread(thread_id).await?;
    Ok(Json(MessagesEnvelope { messages }))
}

async fn create_message(
    State(state): State<ApiState>,
    payload: Result<Json<CreateMessageRequest>, JsonRejection>,
) -> Result<Json<MessageEnvelope>, RelayError> {
    let Json(payload) = payload.map_err(rejection_to_error)?;

    let message = state
        .store
        .create_message(NewMessage {
            thread_id: payload.thread_id,
            text: payload.text,
            image: payload.image,
            author: payload.author,
        })
        .await?;

    announce(&state.dispatcher, Notification::new_message(message.thread_id, &message)).await;
    Ok(Json(MessageEnvelope { message }))
}

async fn delete_message(
    State(state): State<ApiState>,
    Path(message_id): Path<MessageId>,
) -> Result<Json<StatusEnvelope>, RelayError> {
    let message = state.store.delete_message(message_id).await?;

    announce(&state.dispatcher, Notification::delete_message(message.thread_id, &message)).await;
    Ok(Json(StatusEnvelope { message: "message deleted" }))
}

async fn report_message(
    State(state): State<ApiState>,
    Path(message_id): Path<MessageId>,
) -> Result<Json<StatusEnvelope>, RelayError> {
    let message = state.store.report_message(message_id).await?;

    debug!(message_id, reported = message.reported, "message reported");
    Ok(Json(StatusEnvelope { message: "message reported" }))
}

async fn delete_thread(
    State(state): State<ApiState>,
    Path(thread_id): Path<RoomId>,
) -> Result<Json<StatusEnvelope>, RelayError> {
    let thread = state.store.delete_thread(thread_id).await?;

    announce(&state.dispatcher, Notification::delete_thread(thread.id, &thread)).await;
    Ok(Json(StatusEnvelope { message: "thread deleted" }))
}

/// Pushes a committed change to the room. Failures stay in the log.
async fn announce<T: Serialize>(
    dispatcher: &NotificationDispatcher,
    notification: Notification<T>,
) {
    let room_id = notification.room_id;
    match dispatcher.notify(room_id, &notification).await {
        Ok(report) => debug!(
            room_id,
            kind = %notification.kind,
            delivered = report.delivered,
            evicted = report.evicted,
            "change announced"
        ),
        Err(error) => {
            error!(room_id, kind = %notification.kind, %error, "failed to announce change");
        }
    }
}

fn validate_coordinates(lat: f64, long: f64) -> Result<(), RelayError> {
    if !(-90.0..=90.0).contains(&lat) {
        return Err(RelayError::new(ErrorCode::ValidationFailed, "lat must be between -90 and 90")
            .with_details(serde_json::json!({ "field": "lat" })));
    }
    if !(-180.0..=180.0).contains(&long) {
        return Err(RelayError::new(
            ErrorCode::ValidationFailed,
            "long must be between -180 and 180",
        )
        .with_details(serde_json::json!({ "field": "long" })));
    }
    Ok(())
}

fn rejection_to_error(rejection: JsonRejection) -> RelayError {
    RelayError::from_status(rejection.status(), rejection.body_text())
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
        Router,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::router;
    use crate::{
        rooms::{registry::test_handle, NotificationDispatcher, RoomRegistry},
        store::ChatStore,
    };

    fn test_router() -> (Router, Arc<RoomRegistry>) {
        let registry = Arc::new(RoomRegistry::new());
        let dispatcher =
            NotificationDispatcher::new(Arc::clone(&registry), Duration::from_millis(50));
        (router(Arc::new(ChatStore::new()), dispatcher), registry)
    }

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |body| Body::from(body.to_string())))
            .expect("request should build");
        let response = app.clone().oneshot(request).await.expect("request should succeed");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn create_thread(app: &Router) -> i64 {
        let (status, body) = send(
            app,
            Method::POST,
            "/v1/threads",
            Some(json!({ "lat": 51.5, "long": -0.12, "message": "hello", "user_id": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["thread"]["id"].as_i64().expect("thread id")
    }

    #[tokio::test]
    async fn create_thread_returns_thread_and_first_message() {
        let (app, _) = test_router();
        let thread_id = create_thread(&app).await;

        let (status, body) =
            send(&app, Method::GET, &format!("/v1/threads/{thread_id}/messages"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["messages"][0]["is_first"], true);
        assert_eq!(body["messages"][0]["text"], "hello");
    }

    #[tokio::test]
    async fn create_thread_rejects_empty_message_and_bad_coordinates() {
        let (app, _) = test_router();

        let (status, body) = send(
            &app,
            Method::POST,
            "/v1/threads",
            Some(json!({ "lat": 1.0, "long": 1.0, "message": "", "user_id": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_FAILED");

        let (status, body) = send(
            &app,
            Method::POST,
            "/v1/threads",
            Some(json!({ "lat": 91.0, "long": 1.0, "message": "hi", "user_id": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["details"]["field"], "lat");
    }

    #[tokio::test]
    async fn malformed_json_uses_error_envelope() {
        let (app, _) = test_router();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/v1/messages")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .expect("request should build");

        let response = app.oneshot(request).await.expect("request should succeed");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
        let body: Value = serde_json::from_slice(&bytes).expect("body should be json");
        assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn create_message_notifies_room_members() {
        let (app, registry) = test_router();
        let thread_id = create_thread(&app).await;
        let (member, _sender, mut receiver) = test_handle(4);
        registry.join(&member, thread_id);

        let (status, body) = send(
            &app,
            Method::POST,
            "/v1/messages",
            Some(json!({ "thread_id": thread_id, "text": "hi", "user_id": 2, "username": "bo" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"]["username"], "bo");

        let frame = receiver.try_recv().expect("member should be notified");
        let frame: Value = serde_json::from_str(frame.as_str()).expect("frame should be json");
        assert_eq!(frame["type"], "new-message");
        assert_eq!(frame["room_id"], thread_id);
        assert_eq!(frame["data"], body["message"]);
    }

    #[tokio::test]
    async fn create_message_for_unknown_thread_is_not_found() {
        let (app, _) = test_router();
        let (status, body) = send(
            &app,
            Method::POST,
            "/v1/messages",
            Some(json!({ "thread_id": 404, "text": "hi", "user_id": 2 })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn delete_message_notifies_with_deleted_record() {
        let (app, registry) = test_router();
        let thread_id = create_thread(&app).await;
        let (_, created) = send(
            &app,
            Method::POST,
            "/v1/messages",
            Some(json!({ "thread_id": thread_id, "text": "oops", "user_id": 2 })),
        )
        .await;
        let message_id = created["message"]["id"].as_i64().expect("message id");

        let (member, _sender, mut receiver) = test_handle(4);
        registry.join(&member, thread_id);

        let (status, body) =
            send(&app, Method::DELETE, &format!("/v1/messages/{message_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "message deleted");

        let frame = receiver.try_recv().expect("member should be notified");
        let frame: Value = serde_json::from_str(frame.as_str()).expect("frame should be json");
        assert_eq!(frame["type"], "delete-message");
        assert_eq!(frame["data"]["id"], message_id);
        assert_eq!(frame["data"]["text"], "oops");
    }

    #[tokio::test]
    async fn first_message_cannot_be_deleted() {
        let (app, _) = test_router();
        let thread_id = create_thread(&app).await;
        let (_, messages) =
            send(&app, Method::GET, &format!("/v1/threads/{thread_id}/messages"), None).await;
        let first_id = messages["messages"][0]["id"].as_i64().expect("message id");

        let (status, body) =
            send(&app, Method::DELETE, &format!("/v1/messages/{first_id}"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "FIRST_MESSAGE_PROTECTED");
    }

    #[tokio::test]
    async fn delete_thread_notifies_with_thread_record() {
        let (app, registry) = test_router();
        let thread_id = create_thread(&app).await;
        let (member, _sender, mut receiver) = test_handle(4);
        registry.join(&member, thread_id);

        let (status, body) =
            send(&app, Method::DELETE, &format!("/v1/threads/{thread_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "thread deleted");

        let frame = receiver.try_recv().expect("member should be notified");
        let frame: Value = serde_json::from_str(frame.as_str()).expect("frame should be json");
        assert_eq!(frame["type"], "delete-thread");
        assert_eq!(frame["data"]["id"], thread_id);
        assert_eq!(frame["data"]["message"], "hello");

        let (status, _) =
            send(&app, Method::GET, &format!("/v1/threads/{thread_id}/messages"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn failed_delivery_does_not_change_response() {
        let (app, registry) = test_router();
        let thread_id = create_thread(&app).await;
        let (gone, sender, receiver) = test_handle(4);
        registry.join(&gone, thread_id);
        drop((sender, receiver));

        let (status, _) = send(
            &app,
            Method::POST,
            "/v1/messages",
            Some(json!({ "thread_id": thread_id, "text": "anyone?", "user_id": 2 })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(registry.member_count(thread_id), 0);
    }

    #[tokio::test]
    async fn report_message_counts_reports() {
        let (app, _) = test_router();
        let thread_id = create_thread(&app).await;
        let (_, created) = send(
            &app,
            Method::POST,
            "/v1/messages",
            Some(json!({ "thread_id": thread_id, "text": "spam", "user_id": 2 })),
        )
        .await;
        let message_id = created["message"]["id"].as_i64().expect("message id");

        let (status, body) =
            send(&app, Method::POST, &format!("/v1/messages/{message_id}/report"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "message reported");

        let (status, _) = send(&app, Method::POST, "/v1/messages/999/report", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
