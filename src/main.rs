use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use milkscan::auth::{self, IdentityToolkitVerifier, IdentityVerifier, SessionManager};
use milkscan::config::VERSION;
use milkscan::hub;
use milkscan::manager::Manager;
use milkscan::server::routes::{self, LoginPage};
use milkscan::settings::{Settings, DEFAULT_CONFIG_FILE};
use milkscan::Pipeline;
use std::sync::Arc;
use std::{env, process};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const USAGE: &str = "usage: ./milkscan [config file]";

/// The config file named on the command line, in `MILKSCAN_CONFIG`, or the default
fn get_args() -> String {
    let args: Vec<String> = env::args().collect();
    match args.as_slice() {
        [_] => env::var("MILKSCAN_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string()),
        [_, flag] if flag == "-h" || flag == "--help" => {
            println!("{USAGE}");
            process::exit(0);
        }
        [_, path] => path.clone(),
        _ => {
            eprintln!("{USAGE}");
            process::exit(1);
        }
    }
}

/// `RUST_LOG` wins over the configured filter
fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> anyhow::Result<()> {
    let config_file = get_args();
    let settings = Settings::load(&config_file)
        .with_context(|| format!("failed to load settings from {config_file}"))?;
    init_tracing(&settings.log.filter);
    info!("starting milkscan {VERSION}");

    let verifier = IdentityToolkitVerifier::new(&settings.auth)
        .context("identity verification needs `auth.api_key` (MILKSCAN_AUTH__API_KEY)")?;
    let verifier: Arc<dyn IdentityVerifier> = Arc::new(verifier);
    let verifier = web::Data::from(verifier);

    // model downloads use a blocking client, so this happens before the
    // server runtime starts
    let models =
        hub::load_models(&settings.models, &settings.labels).context("failed to load models")?;
    let pipeline = Pipeline::new(models.segmenter, models.classifier, settings.labels.clone());
    let manager = web::Data::new(Manager::new(Arc::new(pipeline), &settings.pool));

    let key = auth::session_key(settings.auth.secret_key.as_deref());
    let sessions = web::Data::new(SessionManager::new(key, &settings.auth));
    let login_page = web::Data::new(LoginPage::new(
        settings.auth.api_key.clone().unwrap_or_default(),
    ));

    let max_content_length = settings.server.max_content_length;
    let address = settings.bind_address();
    info!("listening on {address}");

    actix_web::rt::System::new().block_on(async move {
        HttpServer::new(move || {
            App::new()
                .app_data(manager.clone())
                .app_data(verifier.clone())
                .app_data(sessions.clone())
                .app_data(login_page.clone())
                .app_data(routes::json_config(max_content_length))
                .app_data(routes::form_config(max_content_length))
                .wrap(middleware::Logger::default())
                .configure(routes::configure)
                .default_service(web::to(routes::not_found))
        })
        .bind(&address)?
        .run()
        .await
    })?;

    Ok(())
}
