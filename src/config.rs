use dotenvy::dotenv;
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub port: u16,
    /// HS256 secret used to validate client tokens at the transport boundary.
    pub jwt_secret: Option<String>,
    /// Skip token validation entirely. Development only.
    pub dev_allow_unauthenticated: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, crate::error::AppError> {
        dotenv().ok();
        let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let port = env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3000);

        let dev_allow_unauthenticated = env::var("WS_DEV_ALLOW_ALL")
            .unwrap_or_else(|_| "false".into())
            .eq_ignore_ascii_case("true");

        let jwt_secret = match env::var("JWT_SECRET") {
            Ok(s) if !s.trim().is_empty() => Some(s),
            _ => None,
        };
        if jwt_secret.is_none() && !dev_allow_unauthenticated {
            return Err(crate::error::AppError::Config(
                "JWT_SECRET missing (set WS_DEV_ALLOW_ALL=true to run without auth)".into(),
            ));
        }

        Ok(Self {
            redis_url,
            port,
            jwt_secret,
            dev_allow_unauthenticated,
        })
    }

    #[cfg(test)]
    pub fn test_defaults() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/0".into(),
            port: 3000,
            jwt_secret: Some("test-secret".into()),
            dev_allow_unauthenticated: false,
        }
    }
}
