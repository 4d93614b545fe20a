use std::time::{SystemTime, UNIX_EPOCH};

use crate::models::{Claims, TokenType};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::Error};
use uuid::Uuid;

fn now() -> usize {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as usize)
        .unwrap_or_default()
}

/// Identity carried by both token kinds.
#[derive(Debug, Clone)]
pub struct TokenSubject {
    pub user_id: u64,
    pub email: String,
    pub role: u8,
    pub perms: String,
}

fn issue(
    subject: &TokenSubject,
    token_type: TokenType,
    secret: &str,
    ttl: usize,
) -> Result<(String, Claims), Error> {
    let claims = Claims {
        user_id: subject.user_id,
        sub: subject.email.clone(),
        role: subject.role,
        perms: subject.perms.clone(),
        exp: now() + ttl,
        jti: Uuid::new_v4().to_string(),
        token_type,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok((token, claims))
}

pub fn generate_access_token(
    subject: &TokenSubject,
    secret: &str,
    ttl: usize,
) -> Result<String, Error> {
    issue(subject, TokenType::Access, secret, ttl).map(|(token, _)| token)
}

pub fn generate_refresh_token(
    subject: &TokenSubject,
    secret: &str,
    ttl: usize,
) -> Result<(String, Claims), Error> {
    issue(subject, TokenType::Refresh, secret, ttl)
}

pub fn verify_token(token: &str, secret: &str) -> Result<Claims, String> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| e.to_string())
}

impl From<&Claims> for TokenSubject {
    fn from(c: &Claims) -> Self {
        Self {
            user_id: c.user_id,
            email: c.sub.clone(),
            role: c.role,
            perms: c.perms.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject() -> TokenSubject {
        TokenSubject {
            user_id: 42,
            email: "ops@company.com".into(),
            role: 2,
            perms: "view_leads,edit_leads".into(),
        }
    }

    #[test]
    fn access_token_verifies_with_same_secret() {
        let token = generate_access_token(&subject(), "s3cret", 60).unwrap();
        let claims = verify_token(&token, "s3cret").unwrap();

        assert_eq!(claims.user_id, 42);
        assert_eq!(claims.sub, "ops@company.com");
        assert_eq!(claims.perms, "view_leads,edit_leads");
        assert_eq!(claims.token_type, TokenType::Access);
    }

    #[test]
    fn token_from_other_secret_is_rejected() {
        let token = generate_access_token(&subject(), "s3cret", 60).unwrap();
        assert!(verify_token(&token, "another").is_err());
    }

    #[test]
    fn refresh_tokens_get_unique_jti() {
        let (_, a) = generate_refresh_token(&subject(), "s3cret", 60).unwrap();
        let (_, b) = generate_refresh_token(&subject(), "s3cret", 60).unwrap();
        assert_ne!(a.jti, b.jti);
        assert_eq!(a.token_type, TokenType::Refresh);
    }
}
