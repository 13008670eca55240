//! GitHub device-flow login and credential caching
//!
//! Tokens plus the resolved user identity are cached in the store under
//! `settings:pippy`. Expired tokens are refreshed transparently with the
//! refresh token; everything else falls back to a fresh device-code login.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{GithubError, Result};

pub const SETTINGS_KEY: &str = "settings:pippy";
pub const CLIENT_ID: &str = "46ca5443da5014f4f00f";
pub const SCOPE: &str = "repo workflow user:email read:org read:user";
const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

const DEVICE_CODE_URL: &str = "https://github.com/login/device/code";
const ACCESS_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";

/// Authenticated user identity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GithubUser {
    pub login: String,
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub avatar_url: String,
}

/// Cached credentials, persisted under [`SETTINGS_KEY`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserStore {
    pub access_token: String,
    pub expires_in: i64,
    pub refresh_token: String,
    pub refresh_token_expires_in: i64,
    pub refresh_time: i64,
    #[serde(rename = "user")]
    pub github_user: GithubUser,
}

/// Persist `tokens`, resolving the user profile first when it is missing.
pub async fn cache_tokens(mut tokens: UserStore) -> Result<UserStore> {
    if tokens.github_user.login.is_empty() {
        tokens.github_user = github_user(&tokens.access_token).await?;
    }

    let store = pippy_store::get().await?;
    pippy_store::save_json(store.as_ref(), SETTINGS_KEY, &tokens).await?;
    Ok(tokens)
}

/// Cached credentials, or `None` when nobody has logged in yet.
pub async fn get_cached_tokens() -> Result<Option<UserStore>> {
    let store = pippy_store::get().await?;
    match pippy_store::load_json::<UserStore>(store.as_ref(), SETTINGS_KEY).await {
        Ok(tokens) => Ok(Some(tokens)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub async fn get_cached_access_token() -> Result<String> {
    Ok(login_user().await?.access_token)
}

/// Log the user in: cached token, refreshed token, or a device-code flow.
pub async fn login_user() -> Result<UserStore> {
    if let Some(cached) = get_cached_tokens().await? {
        if !cached.access_token.is_empty() {
            if cached.expires_in > 0 {
                let now = Utc::now().timestamp();
                if now > cached.refresh_time + cached.expires_in {
                    let refreshed =
                        refresh_access_token(CLIENT_ID, "", &cached.refresh_token).await?;
                    return cache_tokens(refreshed).await;
                }
            }
            return Ok(cached);
        }
    }

    let tokens = device_flow_login().await?;
    cache_tokens(tokens).await
}

#[derive(Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: i64,
    interval: i64,
}

#[derive(Deserialize, Default)]
struct AccessTokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    expires_in: i64,
    #[serde(default)]
    refresh_token_expires_in: i64,
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
    #[serde(default)]
    interval: i64,
}

impl AccessTokenResponse {
    fn into_user_store(self) -> UserStore {
        UserStore {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_in: self.expires_in,
            refresh_token_expires_in: self.refresh_token_expires_in,
            refresh_time: Utc::now().timestamp(),
            github_user: GithubUser::default(),
        }
    }
}

async fn post_form<T: serde::de::DeserializeOwned>(
    url: &str,
    params: &[(&str, &str)],
) -> Result<T> {
    let response = reqwest::Client::new()
        .post(url)
        .header("Accept", "application/json")
        .form(params)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(GithubError::api(status.as_u16(), response.text().await?));
    }
    Ok(response.json().await?)
}

async fn device_flow_login() -> Result<UserStore> {
    let device: DeviceCodeResponse = post_form(
        DEVICE_CODE_URL,
        &[("client_id", CLIENT_ID), ("scope", SCOPE)],
    )
    .await?;

    println!(
        "Please enter user verification code {} at {}",
        device.user_code, device.verification_uri
    );

    let started = Utc::now();
    let mut interval = device.interval.max(1);
    while (Utc::now() - started).num_seconds() < device.expires_in {
        let token: AccessTokenResponse = match post_form(
            ACCESS_TOKEN_URL,
            &[
                ("client_id", CLIENT_ID),
                ("device_code", &device.device_code),
                ("grant_type", GRANT_TYPE),
            ],
        )
        .await
        {
            Ok(token) => token,
            Err(_) => {
                tokio::time::sleep(std::time::Duration::from_secs(interval as u64)).await;
                continue;
            }
        };

        if token.access_token.is_empty() {
            if token.error.eq_ignore_ascii_case("slow_down") {
                interval = token.interval.max(interval);
            } else if !token.error.eq_ignore_ascii_case("authorization_pending") {
                return Err(GithubError::Login(format!(
                    "terminal error: {}",
                    token.error_description
                )));
            }
            tokio::time::sleep(std::time::Duration::from_secs(interval as u64)).await;
            continue;
        }

        return Ok(token.into_user_store());
    }

    Err(GithubError::Login(format!(
        "failed to get access token, user did not authorize within {} seconds",
        device.expires_in
    )))
}

/// Exchange a refresh token for a fresh access token.
pub async fn refresh_access_token(
    client_id: &str,
    client_secret: &str,
    refresh_token: &str,
) -> Result<UserStore> {
    let mut params = vec![
        ("client_id", client_id),
        ("refresh_token", refresh_token),
        ("grant_type", "refresh_token"),
    ];
    if !client_secret.is_empty() {
        params.push(("client_secret", client_secret));
    }

    let token: AccessTokenResponse = post_form(ACCESS_TOKEN_URL, &params).await?;
    if token.access_token.is_empty() {
        return Err(GithubError::Login(format!(
            "token refresh rejected: {}",
            token.error_description
        )));
    }
    Ok(token.into_user_store())
}

/// Resolve the authenticated user, falling back to the primary address when
/// the profile email is private.
pub async fn github_user(access_token: &str) -> Result<GithubUser> {
    let client = reqwest::Client::new();
    let get = |url: &str| {
        client
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "pippy")
            .bearer_auth(access_token)
            .send()
    };

    let response = get("https://api.github.com/user").await?;
    let status = response.status();
    if !status.is_success() {
        return Err(GithubError::api(status.as_u16(), response.text().await?));
    }

    #[derive(Deserialize)]
    struct Profile {
        login: String,
        #[serde(default)]
        id: u64,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        email: Option<String>,
        #[serde(default)]
        avatar_url: String,
    }

    let profile: Profile = response.json().await?;
    let mut user = GithubUser {
        login: profile.login,
        id: profile.id,
        name: profile.name.unwrap_or_default(),
        email: profile.email.unwrap_or_default(),
        avatar_url: profile.avatar_url,
    };

    if user.email.is_empty() {
        #[derive(Deserialize)]
        struct Email {
            email: String,
            primary: bool,
        }

        let response = get("https://api.github.com/user/emails").await?;
        if response.status().is_success() {
            let emails: Vec<Email> = response.json().await?;
            if let Some(primary) = emails.into_iter().find(|email| email.primary) {
                user.email = primary.email;
            }
        }
    }

    Ok(user)
}
