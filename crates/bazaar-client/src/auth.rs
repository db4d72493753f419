use anyhow::Context;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};

use bazaar_types::api::Claims;

/// Validate the backend-issued access token and return its claims.
pub fn authenticate(token: &str, secret: &str) -> anyhow::Result<Claims> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .context("access token rejected")?;

    Ok(token_data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use uuid::Uuid;

    fn token(secret: &str, exp: chrono::DateTime<chrono::Utc>) -> (Uuid, String) {
        let user = Uuid::new_v4();
        let claims = Claims {
            sub: user,
            username: "seller".to_string(),
            exp: exp.timestamp() as usize,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap();
        (user, token)
    }

    #[test]
    fn valid_token_yields_claims() {
        let (user, token) = token("shared-secret", chrono::Utc::now() + chrono::Duration::days(1));
        let claims = authenticate(&token, "shared-secret").unwrap();
        assert_eq!(claims.sub, user);
        assert_eq!(claims.username, "seller");
    }

    #[test]
    fn wrong_secret_or_expired_is_rejected() {
        let (_, signed) = token("shared-secret", chrono::Utc::now() + chrono::Duration::days(1));
        assert!(authenticate(&signed, "other-secret").is_err());

        let (_, expired) = token("shared-secret", chrono::Utc::now() - chrono::Duration::hours(2));
        assert!(authenticate(&expired, "shared-secret").is_err());
    }
}
