use std::{
    sync::LazyLock,
    time::{Duration, SystemTime, SystemTimeError, UNIX_EPOCH},
};

use anyhow::anyhow;
use argon2::{
    password_hash::{
        rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier,
        SaltString,
    },
    Argon2,
};
use jsonwebtoken::Algorithm;
use regex::Regex;

use crate::{
    conf::ConfJwt,
    data::{self, Storage, User},
};

pub const MIN_PASSWORD_CHARS: usize = 3;

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$")
        .unwrap_or_else(|e| unreachable!("Fat-fingered email regex: {e}"))
});

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Email and password are required")]
    MissingCredentials,

    #[error("Invalid email format")]
    InvalidEmail,

    #[error("Password must be at least 3 characters long")]
    PasswordTooShort,

    #[error("User with this email already exists")]
    EmailTaken,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<data::Error> for Error {
    fn from(error: data::Error) -> Self {
        match error {
            data::Error::EmailTaken => Self::EmailTaken,
            data::Error::Db(e) => Self::Internal(e.into()),
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq, Clone)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub admin: bool,
    aud: String,
    iss: String,
    iat: u64,
    exp: u64,
}

impl Claims {
    pub fn new(
        uid: i64,
        email: &str,
        admin: bool,
        ttl: Duration,
        jwt_conf: &ConfJwt,
    ) -> Result<Self, SystemTimeError> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
        let exp = now.saturating_add(ttl).as_secs();
        Ok(Self {
            sub: uid.to_string(),
            email: email.to_string(),
            admin,
            aud: jwt_conf.audience.clone(),
            iss: jwt_conf.issuer.clone(),
            iat: now.as_secs(),
            exp,
        })
    }

    #[must_use]
    pub fn uid(&self) -> Option<i64> {
        self.sub.parse().ok()
    }

    pub fn to_str(
        &self,
        jwt_conf: &ConfJwt,
    ) -> jsonwebtoken::errors::Result<String> {
        jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            self,
            &jsonwebtoken::EncodingKey::from_secret(jwt_conf.secret.as_bytes()),
        )
    }

    pub fn from_str(
        str: &str,
        jwt_conf: &ConfJwt,
    ) -> jsonwebtoken::errors::Result<Self> {
        let mut validation = jsonwebtoken::Validation::new(Algorithm::HS256);
        validation.leeway = 0; // "exp" should mean what it says.
        validation.set_audience(&[&jwt_conf.audience]);
        validation.set_issuer(&[&jwt_conf.issuer]);
        let key =
            jsonwebtoken::DecodingKey::from_secret(jwt_conf.secret.as_bytes());
        let jsonwebtoken::TokenData { claims, .. } =
            jsonwebtoken::decode::<Self>(str, &key, &validation)?;
        Ok(claims)
    }
}

/// Signed bearer token for `user`, valid for the configured TTL.
pub fn issue(user: &User, jwt_conf: &ConfJwt) -> anyhow::Result<String> {
    let ttl = Duration::try_from_secs_f64(jwt_conf.ttl)?;
    let claims = Claims::new(user.id, &user.email, user.is_admin, ttl, jwt_conf)?;
    Ok(claims.to_str(jwt_conf)?)
}

#[derive(Debug)]
pub struct Session {
    pub user: User,
    pub token: String,
}

#[tracing::instrument(skip_all, fields(email = tracing::field::Empty))]
pub async fn register(
    storage: &Storage,
    jwt_conf: &ConfJwt,
    email: &str,
    password: &str,
) -> Result<Session, Error> {
    if email.trim().is_empty() || password.is_empty() {
        return Err(Error::MissingCredentials);
    }
    let email = normalize_email(email);
    tracing::Span::current().record("email", email.as_str());
    if !is_valid_email(&email) {
        return Err(Error::InvalidEmail);
    }
    if password.chars().count() < MIN_PASSWORD_CHARS {
        return Err(Error::PasswordTooShort);
    }
    if storage.user_by_email(&email).await?.is_some() {
        return Err(Error::EmailTaken);
    }
    let hash = hash_password_blocking(password.to_string()).await?;
    // Unique index still catches a concurrent registration of the same email.
    let user = storage.user_create(&email, &hash, false).await?;
    let token = issue(&user, jwt_conf)?;
    tracing::info!(uid = user.id, "Registered.");
    Ok(Session { user, token })
}

#[tracing::instrument(skip_all, fields(email = tracing::field::Empty))]
pub async fn login(
    storage: &Storage,
    jwt_conf: &ConfJwt,
    email: &str,
    password: &str,
) -> Result<Session, Error> {
    if email.trim().is_empty() || password.is_empty() {
        return Err(Error::MissingCredentials);
    }
    let email = normalize_email(email);
    tracing::Span::current().record("email", email.as_str());
    let Some(found) = storage.user_by_email(&email).await? else {
        tracing::info!("Login for unknown email.");
        return Err(Error::InvalidCredentials);
    };
    let password = password.to_string();
    let phc = found.password_hash;
    let is_valid =
        tokio::task::spawn_blocking(move || verify_password(&phc, &password))
            .await
            .map_err(|e| anyhow!("Password verification task failed: {e}"))?;
    if !is_valid {
        tracing::info!(uid = found.user.id, "Login with wrong password.");
        return Err(Error::InvalidCredentials);
    }
    let token = issue(&found.user, jwt_conf)?;
    Ok(Session {
        user: found.user,
        token,
    })
}

/// Creates a user directly, bypassing the registration checks that only
/// make sense for the public endpoint (admins can only be made this way).
pub async fn user_add(
    storage: &Storage,
    email: &str,
    password: &str,
    is_admin: bool,
) -> Result<User, Error> {
    let email = normalize_email(email);
    if !is_valid_email(&email) {
        return Err(Error::InvalidEmail);
    }
    let hash = hash_password_blocking(password.to_string()).await?;
    let user = storage.user_create(&email, &hash, is_admin).await?;
    Ok(user)
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("Failed to hash password: {e}"))?;
    Ok(hash.to_string())
}

/// A stored hash that doesn't parse never verifies.
#[must_use]
pub fn verify_password(phc: &str, password: &str) -> bool {
    match PasswordHash::new(phc) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(error) => {
            tracing::error!(?error, "Unparsable password hash in storage.");
            false
        }
    }
}

async fn hash_password_blocking(password: String) -> anyhow::Result<String> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| anyhow!("Password hashing task failed: {e}"))?
}

#[must_use]
pub fn normalize_email(email: &str) -> String {
    sanitize_input(&email.trim().to_lowercase())
}

#[must_use]
pub fn is_valid_email(email: &str) -> bool {
    EMAIL.is_match(email.trim())
}

/// Escapes the characters that matter for HTML rendering.
#[must_use]
pub fn sanitize_input(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '/' => out.push_str("&#x2F;"),
            c => out.push(c),
        }
    }
    out
}
