use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use url::Url;

use super::AuthError;

/// Token endpoint answer of an authorization-code exchange.
#[derive(Deserialize, Clone)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

pub struct OAuthClient {
    client: reqwest::Client,
    client_id: String,
    client_secret: SecretString,
    auth_url: Url,
    token_url: String,
    redirect_uri: String,
    scopes: Vec<String>,
}

impl OAuthClient {
    pub fn new(
        client_id: &str,
        client_secret: SecretString,
        auth_url: &str,
        token_url: &str,
        redirect_uri: &str,
        scopes: &[String],
        user_agent: &str,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            client_id: client_id.to_string(),
            client_secret,
            auth_url: Url::parse(auth_url)?,
            token_url: token_url.to_string(),
            redirect_uri: redirect_uri.to_string(),
            scopes: scopes.to_vec(),
        })
    }

    /// Where to send the browser to grant access.
    pub fn authorize_url(&self, state: &str) -> String {
        let mut url = self.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("state", state);
        url.into()
    }

    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse, AuthError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
        ];
        let response = self
            .client
            .post(&self.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AuthError::TokenEndpoint {
                status: status.as_u16(),
                body,
            });
        }
        let token: TokenResponse =
            serde_json::from_str(&body).map_err(|err| AuthError::Decode(err.to_string()))?;
        if !token.token_type.eq_ignore_ascii_case("bearer") {
            return Err(AuthError::Decode(format!(
                "unsupported token type '{}'",
                token.token_type
            )));
        }
        log::info!("Exchanged authorization code for a token with scope '{}'", token.scope);
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::{http::StatusCode, routing::post, Form, Json, Router};

    use super::*;

    async fn client_for(router: Router) -> OAuthClient {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        OAuthClient::new(
            "client-id",
            SecretString::from("client-secret".to_string()),
            "https://www.openstreetmap.org/oauth2/authorize",
            &format!("http://{}/oauth2/token", addr),
            "http://127.0.0.1:8080/callback",
            &["read_prefs".to_string(), "write_api".to_string()],
            "osm_poi_editor-test",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn authorize_url_carries_all_parameters() {
        let client = client_for(Router::new()).await;
        let url = Url::parse(&client.authorize_url("xyz")).unwrap();
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(url.path(), "/oauth2/authorize");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["client_id"], "client-id");
        assert_eq!(params["redirect_uri"], "http://127.0.0.1:8080/callback");
        assert_eq!(params["scope"], "read_prefs write_api");
        assert_eq!(params["state"], "xyz");
    }

    #[tokio::test]
    async fn exchanges_code_for_token() {
        let router = Router::new().route(
            "/oauth2/token",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                assert_eq!(form["grant_type"], "authorization_code");
                assert_eq!(form["code"], "the-code");
                assert_eq!(form["client_secret"], "client-secret");
                Json(serde_json::json!({
                    "access_token": "abc",
                    "token_type": "Bearer",
                    "scope": "read_prefs write_api",
                    "created_at": 1700000000
                }))
            }),
        );
        let client = client_for(router).await;

        let token = client.exchange_code("the-code").await.unwrap();
        assert_eq!(token.access_token, "abc");
        assert_eq!(token.expires_in, None);
        assert!(!format!("{:?}", token).contains("abc"));
    }

    #[tokio::test]
    async fn rejected_code_is_reported() {
        let router = Router::new().route(
            "/oauth2/token",
            post(|| async { (StatusCode::BAD_REQUEST, r#"{"error":"invalid_grant"}"#) }),
        );
        let client = client_for(router).await;

        match client.exchange_code("stale").await {
            Err(AuthError::TokenEndpoint { status, body }) => {
                assert_eq!(status, 400);
                assert!(body.contains("invalid_grant"));
            }
            other => panic!("expected a token endpoint error, got {:?}", other),
        }
    }
}
