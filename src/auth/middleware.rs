use crate::auth::auth::AuthUser;
use crate::auth::jwt::verify_token;
use crate::config::Config;
use actix_web::middleware::Next;
use actix_web::{
    Error, HttpMessage, HttpResponse,
    body::BoxBody,
    dev::{ServiceRequest, ServiceResponse},
    web::Data,
};
use serde_json::json;

fn reject(req: ServiceRequest, message: &str) -> ServiceResponse<BoxBody> {
    let resp = HttpResponse::Unauthorized().json(json!({ "message": message }));
    req.into_response(resp.map_into_boxed_body())
}

pub async fn auth_middleware(
    req: ServiceRequest,
    next: Next<BoxBody>,
) -> Result<ServiceResponse<BoxBody>, Error> {
    let config = req
        .app_data::<Data<Config>>()
        .cloned()
        .ok_or_else(|| actix_web::error::ErrorInternalServerError("App config missing"))?;

    let header = req
        .headers()
        .get("Authorization")
        .map(|h| h.to_str().map(str::to_owned));

    let header_value = match header {
        Some(Ok(v)) => v,
        Some(Err(_)) => return Ok(reject(req, "Invalid Authorization header encoding")),
        None => return Ok(reject(req, "Missing Authorization header")),
    };

    let token = match header_value.strip_prefix("Bearer ") {
        Some(t) => t,
        None => return Ok(reject(req, "Authorization header must start with Bearer")),
    };

    let claims = match verify_token(token, &config.jwt_secret) {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!(error = %e, "Rejected token");
            return Ok(reject(req, "Invalid or expired token"));
        }
    };

    let auth_user = match AuthUser::from_claims(claims) {
        Ok(u) => u,
        Err(e) => return Ok(reject(req, &e.to_string())),
    };

    req.extensions_mut().insert(auth_user);

    next.call(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwt::{TokenSubject, generate_access_token, generate_refresh_token};
    use actix_web::test::{TestRequest, call_and_read_body, call_service, init_service};
    use actix_web::{App, HttpResponse, middleware::from_fn, web};

    async fn whoami(user: AuthUser) -> HttpResponse {
        HttpResponse::Ok().body(user.email)
    }

    fn subject() -> TokenSubject {
        TokenSubject {
            user_id: 3,
            email: "staff@company.com".into(),
            role: 3,
            perms: "view_leads".into(),
        }
    }

    macro_rules! app {
        ($config:expr) => {
            init_service(
                App::new().app_data(Data::new($config.clone())).service(
                    web::scope("/api")
                        .wrap(from_fn(auth_middleware))
                        .route("/whoami", web::get().to(whoami)),
                ),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn missing_header_is_unauthorized() {
        let config = Config::for_tests();
        let app = app!(config);

        let req = TestRequest::get().uri("/api/whoami").to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), 401);
    }

    #[actix_web::test]
    async fn valid_access_token_reaches_handler() {
        let config = Config::for_tests();
        let app = app!(config);
        let token = generate_access_token(&subject(), &config.jwt_secret, 60).unwrap();

        let req = TestRequest::get()
            .uri("/api/whoami")
            .insert_header(("Authorization", format!("Bearer {token}")))
            .to_request();
        let body = call_and_read_body(&app, req).await;
        assert_eq!(body, "staff@company.com");
    }

    #[actix_web::test]
    async fn refresh_token_is_not_accepted_as_access() {
        let config = Config::for_tests();
        let app = app!(config);
        let (token, _) = generate_refresh_token(&subject(), &config.jwt_secret, 60).unwrap();

        let req = TestRequest::get()
            .uri("/api/whoami")
            .insert_header(("Authorization", format!("Bearer {token}")))
            .to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), 401);
    }

    #[actix_web::test]
    async fn non_bearer_scheme_is_rejected() {
        let config = Config::for_tests();
        let app = app!(config);

        let req = TestRequest::get()
            .uri("/api/whoami")
            .insert_header(("Authorization", "Basic Zm9vOmJhcg=="))
            .to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), 401);
    }
}
