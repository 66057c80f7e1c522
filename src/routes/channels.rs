use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, get, post};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::Config;
use crate::limits::Limit;
use crate::models::User;
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
pub struct RegisterRequest {
    pub uid: String,
    pub display_name: String,
    pub email: String,
    #[serde(default)]
    pub secret: String,
    pub channel: String,
    #[serde(default)]
    pub channel_secret: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub secret: String,
}

/// POST /channels/register — register a uid with a channel, gated by the
/// channel secret. Responds with the user secret for subsequent joins.
#[post("/channels/register", format = "json", data = "<body>")]
pub fn register(
    body: Json<RegisterRequest>,
    cfg: &State<Config>,
    store: &State<Arc<dyn ChatStore>>,
) -> Result<Json<RegisterResponse>, ErrorResponse> {
    let policy = &cfg.policy;
    policy
        .check_name("uid", &body.uid)
        .and_then(|_| policy.check_name("secret", &body.secret))
        .and_then(|_| policy.check_email(&body.email))
        .and_then(|_| {
            policy.check_len_all(&[
                (&body.uid, Limit::Uid),
                (&body.display_name, Limit::DisplayName),
                (&body.channel_secret, Limit::ChanSecret),
                (&body.secret, Limit::Secret),
                (&body.channel, Limit::Chan),
            ])
        })
        .map_err(bad_request)?;

    let mut chat = store
        .get(&body.channel)
        .map_err(|err| internal(format!("invalid secret or unexisting channel: {err}")))?;
    if chat.secret != body.channel_secret {
        return Err(internal("invalid secret or unexisting channel"));
    }

    let secret = chat
        .register(User {
            uid: body.uid.clone(),
            display_name: body.display_name.clone(),
            email: body.email.clone(),
            secret: body.secret.clone(),
        })
        .map_err(|err| internal(format!("error registering to channel: {err}")))?;

    store
        .save(&chat)
        .map_err(|err| internal(format!("could not update channel membership: {err}")))?;
    Ok(Json(RegisterResponse { secret }))
}

/// GET /channels/<name>?secret= — member listing, gated by the channel
/// secret. User secrets are never included.
#[get("/channels/<name>?<secret>")]
pub fn list_members(
    name: &str,
    secret: Option<&str>,
    cfg: &State<Config>,
    store: &State<Arc<dyn ChatStore>>,
) -> Result<Json<Vec<User>>, ErrorResponse> {
    let secret = secret.unwrap_or_default();
    cfg.policy
        .check_len_all(&[(name, Limit::Chan), (secret, Limit::ChanSecret)])
        .map_err(bad_request)?;

    let chat = store
        .get(name)
        .map_err(|err| internal(format!("invalid secret or unexisting channel: {err}")))?;
    if chat.secret != secret {
        return Err(internal("invalid secret or unexisting channel"));
    }
    Ok(Json(chat.list_members()))
}
