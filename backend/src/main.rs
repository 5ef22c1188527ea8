mod classifier;
mod config;
mod error;
mod limiter;
mod routes;
mod upload;

use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware::Logger, web};
use classifier::{ClassLabels, ModelHolder};
use config::ServiceConfig;
use limiter::RateLimitMiddleware;
use routes::configure_routes;
use std::env;
use upload::UploadValidator;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    } else {
        log::error!("Failed to get the current working directory.");
    }

    let config = ServiceConfig::load().map_err(|e| {
        log::error!("Invalid configuration: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
    })?;
    log::info!(
        "Model: {}, max upload: {} bytes, formats: {}, rate limit: {}",
        config.model_path.display(),
        config.max_file_size,
        config.allowed_extensions.join(","),
        config.rate_limit
    );

    let holder = web::Data::new(ModelHolder::load(&config.model_path));
    match holder.load_error() {
        None => log::info!("Serving predictions with {}", holder.path().display()),
        Some(e) => log::warn!("Starting in degraded mode, /predict will return 503: {}", e),
    }

    let labels = web::Data::new(ClassLabels::traffic_signs());
    let validator = web::Data::new(UploadValidator::new(config.upload_limits()));
    let rate_limit = RateLimitMiddleware::new(config.rate_limit);

    let bind_address = config.bind_address();
    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(cors_policy(&config))
            .wrap(Logger::default())
            .app_data(holder.clone())
            .app_data(labels.clone())
            .app_data(validator.clone())
            .configure(|cfg| configure_routes(cfg, rate_limit.clone()))
    })
    .bind(&bind_address)?
    .run()
    .await
}

fn cors_policy(config: &ServiceConfig) -> Cors {
    let cors = if config.allows_any_origin() {
        Cors::default().allow_any_origin()
    } else {
        config
            .allowed_origins
            .iter()
            .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
    };

    cors.allowed_methods(vec!["GET", "POST", "OPTIONS"])
        .allowed_headers(vec![
            actix_web::http::header::ACCEPT,
            actix_web::http::header::CONTENT_TYPE,
        ])
        .max_age(3600)
}
