use crate::{
    api::{attachments, clock, leads, notifications, recruitment, reminders, users},
    auth::{handlers, middleware::auth_middleware},
    config::Config,
};
use actix_governor::{
    Governor, GovernorConfigBuilder, PeerIpKeyExtractor, governor::middleware::NoOpMiddleware,
};
use actix_web::{middleware::from_fn, web};
use std::sync::Arc;

/// Token bucket refilling `requests_per_min` times a minute.
fn build_limiter(requests_per_min: u32) -> Governor<PeerIpKeyExtractor, NoOpMiddleware> {
    let requests_per_min = requests_per_min.max(1);
    let per_ms = (60_000 / requests_per_min as u64).max(1);
    let cfg = GovernorConfigBuilder::default()
        .per_millisecond(per_ms)
        .burst_size(requests_per_min)
        .key_extractor(PeerIpKeyExtractor)
        .finish()
        .unwrap_or_default();
    Governor::new(&cfg)
}

pub fn configure(cfg: &mut web::ServiceConfig, config: Config) {
    let login_limiter = Arc::new(build_limiter(config.rate_login_per_min));
    let register_limiter = Arc::new(build_limiter(config.rate_register_per_min));
    let refresh_limiter = Arc::new(build_limiter(config.rate_refresh_per_min));
    let protected_limiter = Arc::new(build_limiter(config.rate_protected_per_min));

    // uploads are read whole; anything above the limit is refused with 413
    let upload_limit = config.max_upload_bytes;

    // Public routes
    cfg.service(
        web::scope("/auth")
            .service(
                web::resource("/login")
                    .wrap(login_limiter.clone())
                    .route(web::post().to(handlers::login)),
            )
            .service(
                web::resource("/register")
                    .wrap(register_limiter.clone())
                    .route(web::post().to(handlers::register)),
            )
            .service(
                web::resource("/refresh")
                    .wrap(refresh_limiter.clone())
                    .route(web::post().to(handlers::refresh_token)),
            )
            .service(
                web::resource("/logout")
                    .wrap(login_limiter.clone())
                    .route(web::post().to(handlers::logout)),
            ),
    );

    // Protected routes
    cfg.service(
        web::scope(&config.api_prefix)
            .wrap(from_fn(auth_middleware))
            .wrap(protected_limiter)
            // /me
            .service(web::resource("/me").route(web::get().to(handlers::me)))
            .service(web::resource("/me/password").route(web::put().to(handlers::change_password)))
            .service(
                web::scope("/users")
                    .service(web::resource("").route(web::get().to(users::list_users)))
                    .service(
                        web::resource("/{id}")
                            .route(web::get().to(users::get_user))
                            .route(web::delete().to(users::delete_user)),
                    )
                    .service(web::resource("/{id}/role").route(web::put().to(users::set_role)))
                    .service(web::resource("/{id}/active").route(web::put().to(users::set_active)))
                    .service(
                        web::resource("/{id}/permissions")
                            .route(web::put().to(users::set_permissions)),
                    )
                    .service(
                        web::resource("/{id}/permissions/{permission}")
                            .route(web::put().to(users::toggle_permission)),
                    )
                    .service(
                        web::resource("/{id}/password").route(web::put().to(users::reset_password)),
                    ),
            )
            .service(
                web::scope("/clock")
                    .service(web::resource("/in").route(web::post().to(clock::clock_in)))
                    .service(web::resource("/out").route(web::post().to(clock::clock_out)))
                    .service(web::resource("/break/start").route(web::post().to(clock::start_break)))
                    .service(web::resource("/break/end").route(web::post().to(clock::end_break)))
                    .service(web::resource("/status").route(web::get().to(clock::status)))
                    .service(web::resource("/entries").route(web::get().to(clock::list_entries)))
                    .service(web::resource("/sessions").route(web::get().to(clock::list_sessions)))
                    .service(web::resource("/report").route(web::get().to(clock::report)))
                    .service(
                        web::resource("/entries/{id}")
                            .route(web::put().to(clock::edit_entry))
                            .route(web::delete().to(clock::delete_entry)),
                    ),
            )
            .service(
                web::scope("/leads")
                    .service(
                        web::resource("")
                            .route(web::post().to(leads::create_lead))
                            .route(web::get().to(leads::list_leads)),
                    )
                    // before /{id} so "stats" is not taken for an id
                    .service(web::resource("/stats").route(web::get().to(leads::lead_stats)))
                    .service(
                        web::resource("/{id}")
                            .route(web::get().to(leads::get_lead))
                            .route(web::patch().to(leads::update_lead))
                            .route(web::delete().to(leads::delete_lead)),
                    )
                    .service(web::resource("/{id}/status").route(web::put().to(leads::set_status)))
                    .service(
                        web::resource("/{id}/priority").route(web::put().to(leads::set_priority)),
                    )
                    .service(web::resource("/{id}/assign").route(web::put().to(leads::assign)))
                    .service(
                        web::resource("/{id}/attachments")
                            .app_data(web::PayloadConfig::new(upload_limit))
                            .route(web::post().to(leads::upload_attachment))
                            .route(web::get().to(leads::list_attachments)),
                    ),
            )
            .service(
                web::scope("/recruitment")
                    .service(web::resource("/board").route(web::get().to(recruitment::board)))
                    .service(
                        web::resource("/stages").route(web::post().to(recruitment::create_stage)),
                    )
                    .service(
                        web::resource("/stages/{id}")
                            .route(web::put().to(recruitment::rename_stage))
                            .route(web::delete().to(recruitment::delete_stage)),
                    )
                    .service(
                        web::resource("/stages/{id}/move")
                            .route(web::put().to(recruitment::move_stage)),
                    )
                    .service(
                        web::resource("/candidates")
                            .route(web::post().to(recruitment::create_candidate)),
                    )
                    .service(
                        web::resource("/candidates/{id}")
                            .route(web::get().to(recruitment::get_candidate))
                            .route(web::patch().to(recruitment::update_candidate))
                            .route(web::delete().to(recruitment::delete_candidate)),
                    )
                    .service(
                        web::resource("/candidates/{id}/move")
                            .route(web::put().to(recruitment::move_candidate)),
                    )
                    .service(
                        web::resource("/candidates/{id}/attachments")
                            .app_data(web::PayloadConfig::new(upload_limit))
                            .route(web::post().to(recruitment::upload_attachment))
                            .route(web::get().to(recruitment::list_attachments)),
                    ),
            )
            .service(
                web::resource("/attachments/{id}")
                    .route(web::get().to(attachments::download))
                    .route(web::delete().to(attachments::delete)),
            )
            .service(
                web::scope("/reminders")
                    .service(
                        web::resource("")
                            .route(web::post().to(reminders::create_reminder))
                            .route(web::get().to(reminders::list_reminders)),
                    )
                    .service(
                        web::resource("/{id}")
                            .route(web::get().to(reminders::get_reminder))
                            .route(web::patch().to(reminders::update_reminder))
                            .route(web::delete().to(reminders::delete_reminder)),
                    )
                    .service(
                        web::resource("/{id}/complete")
                            .route(web::put().to(reminders::complete_reminder)),
                    ),
            )
            .service(
                web::scope("/notifications")
                    .service(
                        web::resource("").route(web::get().to(notifications::list_notifications)),
                    )
                    .service(
                        web::resource("/unread-count")
                            .route(web::get().to(notifications::unread_count)),
                    )
                    .service(
                        web::resource("/read-all").route(web::put().to(notifications::mark_all_read)),
                    )
                    .service(
                        web::resource("/broadcast").route(web::post().to(notifications::broadcast)),
                    )
                    .service(
                        web::resource("/{id}")
                            .route(web::delete().to(notifications::delete_notification)),
                    )
                    .service(
                        web::resource("/{id}/read").route(web::put().to(notifications::mark_read)),
                    )
                    .service(
                        web::resource("/{id}/unread")
                            .route(web::put().to(notifications::mark_unread)),
                    ),
            ),
    );
}

// LOGIN
//  ├─ access_token (15 min)
//  └─ refresh_token (7 days)

// API REQUEST
//  └─ Authorization: Bearer access_token

// ACCESS EXPIRED
//  └─ POST /auth/refresh with refresh_token
//       └─ returns a new pair, the old refresh token is revoked

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::{TestRequest, call_service, init_service};
    use actix_web::{App, http::StatusCode};
    use sqlx::mysql::MySqlPoolOptions;

    #[test]
    fn limiter_tolerates_zero_rate() {
        // would panic inside the builder if the period collapsed to zero
        let _ = build_limiter(0);
        let _ = build_limiter(120_000);
    }

    #[actix_web::test]
    async fn protected_routes_need_a_token() {
        let config = Config::for_tests();
        let pool = MySqlPoolOptions::new()
            .connect_lazy(&config.database_url)
            .unwrap();

        let app = init_service(
            App::new()
                .app_data(web::Data::new(pool))
                .app_data(web::Data::new(config.clone()))
                .configure(|cfg| configure(cfg, config.clone())),
        )
        .await;

        for uri in ["/api/leads", "/api/clock/status", "/api/notifications/unread-count"] {
            let req = TestRequest::get()
                .uri(uri)
                .peer_addr("127.0.0.1:4000".parse().unwrap())
                .to_request();
            let resp = call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{uri}");
        }
    }
}
