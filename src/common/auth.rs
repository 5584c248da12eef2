//! Inter-node authentication
//!
//! Lock servers only accept calls carrying a token obtained through `login` and a
//! request timestamp close to the server clock. Tokens are HS256 JWTs signed with a
//! key derived from the cluster secret; the secret itself is only kept as an argon2
//! hash for verifying logins.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::common::types::{AuthArgs, LoginArgs, LoginReply, RPC_PROTOCOL_VERSION};

/// Minimum secret key length accepted by the cluster
pub const MIN_SECRET_KEY_LENGTH: usize = 8;

/// Default allowed distance between request time and server time (15 minutes)
pub const DEFAULT_MAX_SKEW: Duration = Duration::from_secs(15 * 60);

/// Default token lifetime (24 hours)
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 3600);

/// Authentication errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing authentication token")]
    MissingToken,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token expired")]
    ExpiredToken,
    #[error("request time {request_time} outside allowed skew of {max_skew_secs}s")]
    RequestTimeSkew {
        request_time: DateTime<Utc>,
        max_skew_secs: u64,
    },
    #[error("invalid access key or secret key")]
    BadCredentials,
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },
    #[error("hash error: {0}")]
    HashError(String),
    #[error("JWT error: {0}")]
    JwtError(String),
}

/// Access/secret key pair shared by all nodes of a cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }


    /// Login request for these credentials, stamped with the current time
    pub fn login_args(&self) -> LoginArgs {
        LoginArgs {
            username: self.access_key.clone(),
            password: self.secret_key.clone(),
            version: RPC_PROTOCOL_VERSION.to_string(),
            request_time: Utc::now(),
        }
    }
}

/// JWT claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Access key the token was issued to
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Issued at (Unix timestamp)
    pub iat: u64,
}

/// Issues and validates inter-node tokens
pub struct TokenIssuer {
    access_key: String,
    secret_hash: String,
    argon2: Argon2<'static>,
    jwt_encoding_key: EncodingKey,
    jwt_decoding_key: DecodingKey,
    token_ttl: Duration,
    max_skew: Duration,
}

impl TokenIssuer {
    pub fn new(credentials: &Credentials) -> Result<Self, AuthError> {
        Self::with_settings(credentials, DEFAULT_TOKEN_TTL, DEFAULT_MAX_SKEW)
    }

    pub fn with_settings(
        credentials: &Credentials,
        token_ttl: Duration,
        max_skew: Duration,
    ) -> Result<Self, AuthError> {
        let argon2 = Argon2::default();
        let salt = SaltString::generate(&mut OsRng);
        let secret_hash = argon2
            .hash_password(credentials.secret_key.as_bytes(), &salt)
            .map_err(|e| AuthError::HashError(e.to_string()))?
            .to_string();

        let signing_secret = blake3::derive_key(
            "minilock 2024 inter-node token signing",
            credentials.secret_key.as_bytes(),
        );

        Ok(Self {
            access_key: credentials.access_key.clone(),
            secret_hash,
            argon2,
            jwt_encoding_key: EncodingKey::from_secret(&signing_secret),
            jwt_decoding_key: DecodingKey::from_secret(&signing_secret),
            token_ttl,
            max_skew,
        })
    }

    /// Validate a login request and issue a token
    pub fn login(&self, args: &LoginArgs) -> Result<LoginReply, AuthError> {
        if args.version != RPC_PROTOCOL_VERSION {
            return Err(AuthError::VersionMismatch {
                expected: RPC_PROTOCOL_VERSION.to_string(),
                actual: args.version.clone(),
            });
        }
        self.check_skew(args.request_time)?;

        if args.username != self.access_key || !self.verify_secret(&args.password) {
            return Err(AuthError::BadCredentials);
        }

        let auth_token = self.issue_token(Utc::now())?;
        Ok(LoginReply { auth_token })
    }

    /// Reject a request unless its token and timestamp are acceptable
    pub fn authorize(&self, auth: &AuthArgs) -> Result<(), AuthError> {
        if auth.auth_token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let mut validation = Validation::default();
        validation.leeway = 0;
        validation.validate_exp = false;

        let claims = decode::<Claims>(&auth.auth_token, &self.jwt_decoding_key, &validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?
            .claims;

        if claims.sub != self.access_key {
            return Err(AuthError::InvalidToken("unknown subject".to_string()));
        }
        if Utc::now().timestamp() as u64 >= claims.exp {
            return Err(AuthError::ExpiredToken);
        }

        self.check_skew(auth.request_time)
    }

    /// Issue a token as if logged in at `issued_at`
    pub fn issue_token(&self, issued_at: DateTime<Utc>) -> Result<String, AuthError> {
        let iat = issued_at.timestamp().max(0) as u64;
        let claims = Claims {
            sub: self.access_key.clone(),
            exp: iat + self.token_ttl.as_secs(),
            iat,
        };

        encode(&Header::default(), &claims, &self.jwt_encoding_key)
            .map_err(|e| AuthError::JwtError(e.to_string()))
    }

    fn verify_secret(&self, secret: &str) -> bool {
        PasswordHash::new(&self.secret_hash)
            .map(|hash| {
                self.argon2
                    .verify_password(secret.as_bytes(), &hash)
                    .is_ok()
            })
            .unwrap_or(false)
    }

    fn check_skew(&self, request_time: DateTime<Utc>) -> Result<(), AuthError> {
        let max_skew = ChronoDuration::from_std(self.max_skew).unwrap_or(ChronoDuration::MAX);
        let skew = (Utc::now() - request_time).abs();
        if skew > max_skew {
            return Err(AuthError::RequestTimeSkew {
                request_time,
                max_skew_secs: self.max_skew.as_secs(),
            });
        }
        Ok(())
    }
}
