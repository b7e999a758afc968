use std::sync::Arc;

use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod handler;
mod job;
mod queue;
#[cfg(all(test, unix))]
mod testing;

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .filter_module("frame_pipe", log::LevelFilter::Debug)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn main() {
    init_logging();
    let config_path = config::AppConfig::default_path();
    let config = config::AppConfig::load(&config_path);
    let bind = config.bind.clone();
    let ctx = Arc::new(config::AppContext::new(config));

    let cancel = CancellationToken::new();
    let queue = queue::JobQueue::new(ctx, &cancel);

    api::start_api_server(queue.clone(), bind, cancel.clone());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("Ctrl-C received, stopping");
                cancel.cancel();
            },
        }
    }

    queue.shutdown().await;
}
