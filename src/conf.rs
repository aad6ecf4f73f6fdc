use std::{
    env,
    fmt::Debug,
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, OnceLock},
};

use anyhow::Context;

static GLOBAL: OnceLock<Arc<Conf>> = OnceLock::new();

/// Read the config file and environment once. A bad file or override is
/// returned here, so call this early to fail with an error rather than a
/// panic in [`global`].
pub fn init() -> anyhow::Result<Arc<Conf>> {
    if let Some(conf) = GLOBAL.get() {
        return Ok(conf.clone());
    }
    let conf = Arc::new(read_or_create_default()?);
    Ok(GLOBAL.get_or_init(|| conf).clone())
}

#[must_use]
pub fn global() -> Arc<Conf> {
    init().unwrap_or_else(|error| {
        panic!("Failed to initialize global config: {error:?}")
    })
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub struct Conf {
    #[serde(
        serialize_with = "serialize_log_level",
        deserialize_with = "deserialize_log_level"
    )]
    pub log_level: tracing::Level,
    pub addr: IpAddr,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt: ConfJwt,
    pub llm: ConfLlm,
    pub free_calls_limit: u64,
    pub history_limit: u32,
    pub max_message_chars: usize,
    pub sqlite_busy_timeout: f32,
    pub tls: Option<Tls>,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            log_level: tracing::Level::INFO,
            addr: "127.0.0.1".parse().unwrap_or_else(|_| {
                unreachable!("Fat-fingered default IP address!")
            }),
            port: 3000,
            db_path: PathBuf::from("data.db"),
            jwt: ConfJwt::default(),
            llm: ConfLlm::default(),
            free_calls_limit: 20,
            history_limit: 50,
            max_message_chars: 1000,
            sqlite_busy_timeout: 60.0,
            tls: None,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub struct Tls {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(serde::Serialize, serde::Deserialize, Clone)]
pub struct ConfJwt {
    pub secret: String,
    pub audience: String,
    pub issuer: String,

    /// Token lifetime, in seconds.
    pub ttl: f64,
}

impl Default for ConfJwt {
    fn default() -> Self {
        Self {
            secret: "default-secret-change-in-production".to_string(),
            audience: "moodbot".to_string(),
            issuer: "moodbot".to_string(),
            ttl: 24.0 * 60.0 * 60.0,
        }
    }
}

impl Debug for ConfJwt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfJwt")
            .field("secret", &"<XXXXX>")
            .field("audience", &self.audience)
            .field("issuer", &self.issuer)
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub struct ConfLlm {
    pub base_url: String,

    /// Seconds to wait for the LLM service before falling back.
    pub timeout: f32,

    /// Reply served when the LLM service can't be reached.
    pub fallback_reply: String,
}

impl Default for ConfLlm {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            timeout: 30.0,
            fallback_reply: "I'm having trouble connecting right now. \
                Please try again later! 😊"
                .to_string(),
        }
    }
}

impl Conf {
    /// Overlay the deployment environment on top of file values.
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_env_from(|key| env::var(key).ok())
    }

    pub fn apply_env_from<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.port = port
                .trim()
                .parse()
                .context(format!("Invalid PORT: {port:?}"))?;
        }
        if let Some(path) = lookup("DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(secret) = lookup("JWT_SECRET") {
            self.jwt.secret = secret;
        }
        if let Some(url) = lookup("LLM_SERVICE_URL") {
            self.llm.base_url = url;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log_level = tracing::Level::from_str(level.trim())
                .map_err(|_| anyhow::anyhow!("Invalid LOG_LEVEL: {level:?}"))?;
        }
        Ok(())
    }
}

fn serialize_log_level<S>(
    level: &tracing::Level,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let s = level.to_string();
    serializer.serialize_str(&s)
}

fn deserialize_log_level<'de, D>(
    deserializer: D,
) -> Result<tracing::Level, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    let s = String::deserialize(deserializer)?;
    tracing::Level::from_str(&s).map_err(serde::de::Error::custom)
}

pub fn read_or_create_default() -> anyhow::Result<Conf> {
    let path = "conf/conf.toml";
    let mut conf = read_or_create_default_(path).context(path)?;
    conf.apply_env()?;
    Ok(conf)
}

pub fn read_or_create_default_<P: AsRef<Path>>(
    path: P,
) -> anyhow::Result<Conf> {
    let path = path.as_ref();
    let conf = if fs::exists(path)? {
        let s = fs::read_to_string(path)?;
        toml::from_str(&s)?
    } else {
        if let Some(parent) = path.parent() {
            let ctx = format!(
                "Failed to create parent directory \
                for conf file: {path:?}"
            );
            fs::create_dir_all(parent).context(ctx)?;
        }
        let conf = Conf::default();
        let s = toml::to_string_pretty(&conf)?;
        fs::write(path, s)?;
        conf
    };
    Ok(conf)
}
