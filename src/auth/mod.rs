pub mod oauth;
pub mod session;

pub use oauth::{OAuthClient, TokenResponse};
pub use session::{cookie_value, SessionClaims, SessionCodec, SESSION_COOKIE, STATE_COOKIE};

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("request to the token endpoint failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("token endpoint answered {status}: {body}")]
    TokenEndpoint { status: u16, body: String },
    #[error("unexpected token endpoint response: {0}")]
    Decode(String),
    #[error("invalid session: {0}")]
    Session(#[from] jsonwebtoken::errors::Error),
}
