use crate::{
    auth::jwt::verify_token,
    config::Config,
    error::ApiError,
    model::role::{Permission, PermissionSet, Role, parse_permissions},
    models::{Claims, TokenType},
};
use actix_web::{FromRequest, HttpMessage, HttpRequest, dev::Payload, web::Data};
use futures::future::{Ready, ready};

#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: u64,
    pub email: String,
    pub role: Role,
    pub permissions: PermissionSet,
}

impl AuthUser {
    pub fn from_claims(claims: Claims) -> Result<Self, ApiError> {
        if claims.token_type != TokenType::Access {
            return Err(ApiError::Unauthorized("Access token required".into()));
        }

        let role = Role::from_id(claims.role)
            .ok_or_else(|| ApiError::Unauthorized("Invalid role".into()))?;

        Ok(AuthUser {
            user_id: claims.user_id,
            email: claims.sub,
            role,
            permissions: parse_permissions(&claims.perms),
        })
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ApiError::forbidden("Admin only"))
        }
    }

    /// Admins pass every check; everyone else needs the explicit grant.
    pub fn can(&self, permission: Permission) -> bool {
        self.is_admin() || self.permissions.contains(&permission)
    }

    pub fn require(&self, permission: Permission) -> Result<(), ApiError> {
        if self.can(permission) {
            Ok(())
        } else {
            Err(ApiError::forbidden(format!("Missing permission: {permission}")))
        }
    }
}

fn bearer_token(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
}

impl FromRequest for AuthUser {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        // Set by auth_middleware on protected scopes.
        if let Some(user) = req.extensions().get::<AuthUser>() {
            return ready(Ok(user.clone()));
        }

        let token = match bearer_token(req) {
            Some(t) => t,
            None => return ready(Err(ApiError::Unauthorized("Missing token".into()))),
        };

        let config = match req.app_data::<Data<Config>>() {
            Some(c) => c,
            None => {
                tracing::error!("Config missing from app data");
                return ready(Err(ApiError::Internal));
            }
        };

        let claims = match verify_token(token, &config.jwt_secret) {
            Ok(c) => c,
            Err(_) => return ready(Err(ApiError::Unauthorized("Invalid token".into()))),
        };

        ready(AuthUser::from_claims(claims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(role: Role, perms: &[Permission]) -> AuthUser {
        AuthUser {
            user_id: 1,
            email: "a@b.c".into(),
            role,
            permissions: perms.iter().copied().collect(),
        }
    }

    #[test]
    fn admin_passes_every_permission_check() {
        let admin = user(Role::Admin, &[]);
        assert!(admin.require(Permission::ManageUsers).is_ok());
        assert!(admin.require_admin().is_ok());
    }

    #[test]
    fn staff_needs_explicit_grant() {
        let staff = user(Role::Staff, &[Permission::ViewLeads]);
        assert!(staff.require(Permission::ViewLeads).is_ok());
        assert!(matches!(
            staff.require(Permission::EditLeads),
            Err(ApiError::Forbidden(_))
        ));
        assert!(staff.require_admin().is_err());
    }

    #[test]
    fn refresh_claims_cannot_authenticate_requests() {
        let claims = Claims {
            user_id: 1,
            sub: "a@b.c".into(),
            role: 1,
            perms: String::new(),
            exp: 0,
            jti: "x".into(),
            token_type: TokenType::Refresh,
        };
        assert!(matches!(
            AuthUser::from_claims(claims),
            Err(ApiError::Unauthorized(_))
        ));
    }
}
