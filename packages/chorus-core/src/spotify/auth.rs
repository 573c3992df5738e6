//! OAuth flows against the provider's accounts service.
//!
//! Builds the user-facing authorization URL and exchanges authorization
//! codes and refresh tokens for access tokens.

use reqwest::Client;
use url::Url;

use super::api::{SpotifyError, SpotifyResult};
use super::types::TokenGrant;
use crate::state::SpotifyConfig;

const ACCOUNTS_BASE: &str = "https://accounts.spotify.com";

/// Scopes the room coordinator needs: read playback, control playback,
/// read the library for random-liked picks, and identify the account.
pub const OAUTH_SCOPES: &[&str] = &[
    "user-read-playback-state",
    "user-modify-playback-state",
    "user-library-read",
    "user-read-email",
    "user-read-private",
];

/// Builds the authorization redirect URL, with `state` carrying the
/// opaque session id through the OAuth round-trip.
#[must_use]
pub fn authorize_url(config: &SpotifyConfig, state: &str) -> String {
    let mut url = Url::parse(&format!("{ACCOUNTS_BASE}/authorize")).expect("static URL parses");

    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &config.client_id)
        .append_pair("scope", &OAUTH_SCOPES.join(" "))
        .append_pair("redirect_uri", &config.redirect_uri)
        .append_pair("state", state);

    url.to_string()
}

async fn token_request(
    client: &Client,
    config: &SpotifyConfig,
    form: &[(&str, &str)],
) -> SpotifyResult<TokenGrant> {
    let res = client
        .post(format!("{ACCOUNTS_BASE}/api/token"))
        .basic_auth(&config.client_id, Some(&config.client_secret))
        .form(form)
        .send()
        .await?;

    let status = res.status();
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        return Err(match status.as_u16() {
            400 | 401 => SpotifyError::Unauthorized,
            code => SpotifyError::Api(code, body),
        });
    }

    res.json::<TokenGrant>()
        .await
        .map_err(|e| SpotifyError::Parse(e.to_string()))
}

/// Exchanges an authorization code for an access + refresh token pair.
pub async fn code_grant(
    client: &Client,
    config: &SpotifyConfig,
    code: &str,
) -> SpotifyResult<TokenGrant> {
    token_request(
        client,
        config,
        &[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &config.redirect_uri),
        ],
    )
    .await
}

/// Exchanges a refresh token for a fresh access token.
pub async fn refresh_grant(
    client: &Client,
    config: &SpotifyConfig,
    refresh_token: &str,
) -> SpotifyResult<TokenGrant> {
    token_request(
        client,
        config,
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ],
    )
    .await
}
