// Route module decomposition. The admin guard lives here; route
// functions in submodules.

mod admin;
mod channels;
#[path = "connect.rs"]
mod connect_route;

pub use admin::{create_channel, list_channels, unread_count};
pub use channels::{list_members, register};
pub use connect_route::connect;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};

use crate::config::Config;

/// Basic-auth guard for the `/admin/*` surface, checked against the
/// configured admin account.
pub struct AdminAuth;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminAuth {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(cfg) = req.rocket().state::<Config>() else {
            return Outcome::Error((Status::InternalServerError, ()));
        };
        if let Some(auth) = req.headers().get_one("Authorization")
            && let Some(encoded) = auth.strip_prefix("Basic ")
            && let Ok(decoded) = BASE64.decode(encoded.trim())
            && let Ok(creds) = String::from_utf8(decoded)
            && let Some((user, pass)) = creds.split_once(':')
            && user == cfg.admin_username
            && pass == cfg.admin_password
        {
            return Outcome::Success(AdminAuth);
        }
        Outcome::Error((Status::Unauthorized, ()))
    }
}
