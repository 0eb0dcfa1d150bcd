use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Context;
use pdf_latex_converter::gate::RequestGate;
use pdf_latex_converter::markup::OpenAiGenerator;
use pdf_latex_converter::pdf::PdfiumRasterizer;
use pdf_latex_converter::quota::QuotaPolicy;
use pdf_latex_converter::store::Store;
use pdf_latex_converter::{configure, AppState, Config};
use std::sync::Arc;
use std::time::Duration;

const STORE_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("Invalid configuration")?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log_level()))
        .init();
    config.warn_insecure_defaults();

    let store = Store::connect(&config.redis_url, config.key_prefix(), STORE_CONNECT_TIMEOUT).await;
    let policy = Arc::new(QuotaPolicy::new(store).fail_open(config.fail_open));
    let generator = OpenAiGenerator::builder(config.openai_api_key.clone())
        .base_url(config.openai_base_url.clone())
        .model(config.openai_model.clone())
        .timeout(config.openai_timeout)
        .build()
        .context("Failed to create the model client")?;
    let rasterizer = PdfiumRasterizer::new(config.pdfium_library_path.clone());

    let state = web::Data::new(AppState {
        gate: RequestGate::new(policy, Arc::new(rasterizer), Arc::new(generator), config.limits),
    });

    log::info!(
        "Starting server on {}:{} (model {})",
        config.host,
        config.port,
        config.openai_model
    );
    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .configure(configure(state.clone()))
    })
    .bind((config.host.as_str(), config.port))
    .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?
    .run()
    .await
    .context("Server error")
}
