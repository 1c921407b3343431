use emergency_broadcast::AppResources;
use emergency_broadcast::api::start_webserver;
use emergency_broadcast::channels::{ChannelAdapter, ChannelRouter, EmailChannel, LoggingChannel};
use emergency_broadcast::config::load_config_or_panic;
use emergency_broadcast::emergency::scheduler::{
    dispatch_loop, spawn_retention_task, supervise_evaluations,
};
use emergency_broadcast::emergency::types::Channel;
use emergency_broadcast::emergency::{EmergencyController, PriorityDispatcher};
use emergency_broadcast::render::TemplateRenderer;
use emergency_broadcast::store::SeaOrmRepository;
use sea_orm::Database;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn initialize_standard_tracing() {
    let default_directives = "emergency_broadcast=info,sea_orm=info,hyper=warn";
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = fmt::layer().with_target(true).with_level(true);

    registry.with(layer).init();
}

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    initialize_standard_tracing();

    let config = Arc::new(load_config_or_panic());

    let db = Arc::new(Database::connect(&config.database_url).await?);

    // Email goes over SMTP when configured; SMS and WhatsApp gateways are
    // external and stand in as the logging channel here.
    let logging: Arc<dyn ChannelAdapter> = Arc::new(LoggingChannel);
    let email: Arc<dyn ChannelAdapter> = match &config.smtp {
        Some(smtp) => Arc::new(EmailChannel::from_config(smtp)?),
        None => {
            tracing::warn!(
                name = "startup.smtp.missing",
                target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                message = "No SMTP configured, email sends go to the log",
            );
            logging.clone()
        }
    };
    let router = ChannelRouter::new()
        .with_route(Channel::Email, email)
        .with_route(Channel::Sms, logging.clone())
        .with_route(Channel::WhatsApp, logging);

    let dispatcher = Arc::new(PriorityDispatcher::new(
        Arc::new(router),
        config.scheduler.dispatch_concurrency,
    ));
    let controller = Arc::new(EmergencyController::new(
        Arc::new(SeaOrmRepository::new(db)),
        dispatcher,
        Arc::new(TemplateRenderer::new()),
    ));

    controller.recover().await?;

    tokio::spawn(supervise_evaluations(
        controller.clone(),
        config.scheduler.clone(),
    ));
    tokio::spawn(dispatch_loop(controller.clone(), config.scheduler.clone()));
    spawn_retention_task(controller.clone(), config.retention.clone());

    let tasks = controller.tasks().clone();
    let resources = AppResources { controller, config };
    let served = start_webserver(resources).await;
    tasks.stop_all().await;
    served
}
