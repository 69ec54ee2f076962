use axum::http::{header, HeaderMap};
use jsonwebtoken::{
    decode, encode, get_current_timestamp, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{oauth::TokenResponse, AuthError};

pub const SESSION_COOKIE: &str = "osm_session";
pub const STATE_COOKIE: &str = "osm_oauth_state";
const STATE_MAX_AGE_SECS: u64 = 600;

/// What the signed session cookie carries.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionClaims {
    pub access_token: String,
    pub scope: String,
    pub iat: u64,
    pub exp: u64,
}

/// Signs and verifies the session cookie (HS256).
pub struct SessionCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl_secs: u64,
    secure: bool,
}

impl SessionCodec {
    pub fn new(secret: &SecretString, ttl_hours: u64, secure: bool) -> Self {
        let key = secret.expose_secret().as_bytes();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);
        Self {
            encoding: EncodingKey::from_secret(key),
            decoding: DecodingKey::from_secret(key),
            validation,
            ttl_secs: ttl_hours * 3600,
            secure,
        }
    }

    /// Session lifetime is the configured TTL, shortened to the token's own expiry.
    pub fn claims_for(&self, token: &TokenResponse) -> SessionClaims {
        let now = get_current_timestamp();
        let lifetime = token
            .expires_in
            .map_or(self.ttl_secs, |expires_in| expires_in.min(self.ttl_secs));
        SessionClaims {
            access_token: token.access_token.clone(),
            scope: token.scope.clone(),
            iat: now,
            exp: now + lifetime,
        }
    }

    pub fn sign(&self, claims: &SessionClaims) -> Result<String, AuthError> {
        Ok(encode(&Header::new(Algorithm::HS256), claims, &self.encoding)?)
    }

    pub fn verify(&self, value: &str) -> Result<SessionClaims, AuthError> {
        Ok(decode::<SessionClaims>(value, &self.decoding, &self.validation)?.claims)
    }

    /// Reads and verifies the session cookie of a request, if any.
    pub fn read_session(&self, headers: &HeaderMap) -> Option<SessionClaims> {
        let value = cookie_value(headers, SESSION_COOKIE)?;
        match self.verify(value) {
            Ok(claims) => Some(claims),
            Err(err) => {
                log::debug!("Ignoring session cookie: {}", err);
                None
            }
        }
    }

    pub fn session_cookie(&self, claims: &SessionClaims) -> Result<String, AuthError> {
        let max_age = claims.exp.saturating_sub(claims.iat);
        Ok(self.cookie(SESSION_COOKIE, &self.sign(claims)?, max_age))
    }

    pub fn state_cookie(&self, state: &str) -> String {
        self.cookie(STATE_COOKIE, state, STATE_MAX_AGE_SECS)
    }

    pub fn clear_cookie(&self, name: &str) -> String {
        self.cookie(name, "", 0)
    }

    fn cookie(&self, name: &str, value: &str, max_age: u64) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            name, value, max_age
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}
