use std::convert::Infallible;
use std::path::Path;

use log::error;
use serde_json::{json, Map, Value};
use warp::http::StatusCode;
use warp::reject::Reject;
use warp::{Filter, Rejection, Reply};

use crate::error::ChatError;
use crate::messages::MessagesRead;
use crate::models::{NewMessage, NotificationKind};
use crate::server::Server;
use crate::store::{MessageStore, NotificationStore};

#[derive(Debug)]
struct ApiError(ChatError);

impl Reject for ApiError {}

fn reject(e: ChatError) -> Rejection {
    warp::reject::custom(ApiError(e))
}

fn with_server(server: Server) -> impl Filter<Extract = (Server,), Error = Infallible> + Clone {
    warp::any().map(move || server.clone())
}

/// WebSocket upgrade at `/ws`, the REST surface, and static files.
pub fn routes(
    server: Server,
    static_dir: &Path,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let ws_route = warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_server(server.clone()))
        .map(|ws: warp::ws::Ws, server: Server| {
            ws.on_upgrade(move |socket| async move {
                server.handle_connection(socket).await;
            })
        });

    let static_files = warp::fs::dir(static_dir.to_path_buf());

    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["GET", "POST", "PATCH", "OPTIONS"])
        .allow_header("content-type");

    ws_route
        .or(rest_routes(server))
        .or(static_files)
        .with(cors)
        .recover(handle_rejection)
}

pub fn rest_routes(
    server: Server,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let list_messages = warp::path!("message" / "room" / String)
        .and(warp::get())
        .and(with_server(server.clone()))
        .and_then(list_messages);

    let create_message = warp::path!("message")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_server(server.clone()))
        .and_then(create_message);

    let mark_read = warp::path!("message" / "read")
        .and(warp::patch())
        .and(warp::body::json())
        .and(with_server(server.clone()))
        .and_then(mark_read);

    let list_conversations = warp::path!("conversation" / String)
        .and(warp::get())
        .and(with_server(server.clone()))
        .and_then(list_conversations);

    let list_notifications = warp::path!("notification" / "GetAllnotification")
        .and(warp::get())
        .and(with_server(server.clone()))
        .and_then(list_notifications);

    let unseen_count = warp::path!("notification" / "unseen-count")
        .and(warp::get())
        .and(with_server(server.clone()))
        .and_then(unseen_count);

    let mark_all_seen = warp::path!("notification" / "mark-all-seen")
        .and(warp::patch())
        .and(with_server(server.clone()))
        .and_then(mark_all_seen);

    let new_donation = warp::path!("donation")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_server(server.clone()))
        .and_then(|body: Map<String, Value>, server: Server| {
            create_domain_item(NotificationKind::Donation, body, server)
        });

    let new_in_need = warp::path!("inNeed")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_server(server))
        .and_then(|body: Map<String, Value>, server: Server| {
            create_domain_item(NotificationKind::InNeed, body, server)
        });

    list_messages
        .or(create_message)
        .or(mark_read)
        .or(list_conversations)
        .or(list_notifications)
        .or(unseen_count)
        .or(mark_all_seen)
        .or(new_donation)
        .or(new_in_need)
}

async fn list_messages(room_id: String, server: Server) -> Result<impl Reply, Rejection> {
    let messages = server
        .store()
        .list_messages(&room_id)
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&messages))
}

async fn create_message(draft: NewMessage, server: Server) -> Result<impl Reply, Rejection> {
    let message = server
        .store()
        .create_message(draft)
        .await
        .map_err(reject)?;
    Ok(warp::reply::with_status(
        warp::reply::json(&message),
        StatusCode::CREATED,
    ))
}

async fn mark_read(body: MessagesRead, server: Server) -> Result<impl Reply, Rejection> {
    server
        .store()
        .mark_read(&body.message_ids)
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&json!({ "success": true })))
}

async fn list_conversations(user_id: String, server: Server) -> Result<impl Reply, Rejection> {
    let conversations = server
        .store()
        .list_conversations(&user_id)
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&conversations))
}

async fn list_notifications(server: Server) -> Result<impl Reply, Rejection> {
    let notifications = server
        .store()
        .list_notifications()
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&notifications))
}

async fn unseen_count(server: Server) -> Result<impl Reply, Rejection> {
    let count = server.store().unseen_count().await.map_err(reject)?;
    Ok(warp::reply::json(&json!({ "count": count })))
}

async fn mark_all_seen(server: Server) -> Result<impl Reply, Rejection> {
    server.store().mark_all_seen().await.map_err(reject)?;
    Ok(warp::reply::json(&json!({ "success": true })))
}

async fn create_domain_item(
    kind: NotificationKind,
    body: Map<String, Value>,
    server: Server,
) -> Result<impl Reply, Rejection> {
    let label = body
        .get("name")
        .or_else(|| body.get("title"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let message = match (kind, label) {
        (NotificationKind::Donation, Some(label)) => format!("New donation item: {label}"),
        (NotificationKind::Donation, None) => "A new donation item was posted".to_string(),
        (NotificationKind::InNeed, Some(label)) => format!("New in-need request: {label}"),
        (NotificationKind::InNeed, None) => "A new in-need request was posted".to_string(),
    };

    let notification = server
        .notify_admins(kind, message, body)
        .await
        .map_err(reject)?;
    Ok(warp::reply::with_status(
        warp::reply::json(&notification),
        StatusCode::CREATED,
    ))
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if let Some(ApiError(e)) = err.find::<ApiError>() {
        match e {
            ChatError::Validation(reason) => (StatusCode::BAD_REQUEST, reason.clone()),
            _ => {
                error!("Request failed: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
    } else {
        error!("Unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&json!({ "error": message })),
        status,
    ))
}
