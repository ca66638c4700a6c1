use crate::error::AppError;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject - typically the user id.
    pub sub: String,
    /// Expiration time (unix timestamp).
    pub exp: i64,
}

/// Validate an HS256 token and extract its claims.
pub fn verify_token(token: &str, secret: &str) -> Result<Claims, AppError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map(|data| data.claims)
    .map_err(|_| AppError::Unauthorized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn make_token(sub: &str, exp: i64, secret: &str) -> String {
        let claims = Claims {
            sub: sub.into(),
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_yields_claims() {
        let exp = chrono::Utc::now().timestamp() + 3600;
        let token = make_token("user-1", exp, "secret");
        let claims = verify_token(&token, "secret").unwrap();
        assert_eq!(claims.sub, "user-1");
    }

    #[test]
    fn wrong_secret_is_unauthorized() {
        let exp = chrono::Utc::now().timestamp() + 3600;
        let token = make_token("user-1", exp, "secret");
        assert!(matches!(
            verify_token(&token, "other").unwrap_err(),
            AppError::Unauthorized
        ));
    }

    #[test]
    fn expired_token_is_unauthorized() {
        let exp = chrono::Utc::now().timestamp() - 3600;
        let token = make_token("user-1", exp, "secret");
        assert!(verify_token(&token, "secret").is_err());
    }
}
