use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, get, post};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::AdminAuth;
use crate::config::Config;
use crate::limits::Limit;
use crate::models::Chat;
use crate::store::ChatStore;

type ErrorResponse = (Status, Json<serde_json::Value>);

fn bad_request(err: impl ToString) -> ErrorResponse {
    (
        Status::BadRequest,
        Json(serde_json::json!({"error": err.to_string()})),
    )
}

fn internal(err: impl ToString) -> ErrorResponse {
    (
        Status::InternalServerError,
        Json(serde_json::json!({"error": err.to_string()})),
    )
}

#[derive(Debug, Deserialize)]
pub struct CreateChannelRequest {
    pub name: String,
    #[serde(default)]
    pub is_private: bool,
}

/// POST /admin/channels — create a channel; responds with the channel
/// secret (empty for public channels).
#[post("/admin/channels", format = "json", data = "<body>")]
pub fn create_channel(
    _auth: AdminAuth,
    body: Json<CreateChannelRequest>,
    cfg: &State<Config>,
    store: &State<Arc<dyn ChatStore>>,
) -> Result<Json<String>, ErrorResponse> {
    cfg.policy
        .check_name("name", &body.name)
        .and_then(|_| cfg.policy.check_len(&body.name, Limit::Chan))
        .map_err(bad_request)?;

    let chat = Chat::new(&body.name, body.is_private);
    store
        .save(&chat)
        .map_err(|err| internal(format!("could not create channel: {err}")))?;
    Ok(Json(chat.secret))
}

/// GET /admin/channels — public channel names.
#[get("/admin/channels")]
pub fn list_channels(
    _auth: AdminAuth,
    store: &State<Arc<dyn ChatStore>>,
) -> Result<Json<Vec<String>>, ErrorResponse> {
    let names = store
        .list_channels()
        .map_err(|err| internal(format!("unable to fetch channels: {err}")))?;
    Ok(Json(names))
}

#[derive(Debug, Serialize)]
pub struct UnreadCountResponse {
    pub count: u64,
}

/// GET /admin/channels/<name>/user/<uid> — unread message count.
#[get("/admin/channels/<name>/user/<uid>")]
pub fn unread_count(
    _auth: AdminAuth,
    name: &str,
    uid: &str,
    cfg: &State<Config>,
    store: &State<Arc<dyn ChatStore>>,
) -> Result<Json<UnreadCountResponse>, ErrorResponse> {
    cfg.policy
        .check_len_all(&[(uid, Limit::Uid), (name, Limit::Chan)])
        .map_err(bad_request)?;
    Ok(Json(UnreadCountResponse {
        count: store.get_unread_count(uid, name),
    }))
}
