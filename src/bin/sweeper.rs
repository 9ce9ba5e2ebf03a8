#[macro_use]
extern crate log;

#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    let config = match esign_core::Config::load() {
        Ok(c) => c,
        Err(err) => {
            error!("Unable to load config: {}", err);
            std::process::exit(1);
        }
    };
    let app = match esign_core::setup(&config) {
        Ok(a) => a,
        Err(err) => {
            error!("Unable to start: {} {}", err, err.detail());
            std::process::exit(1);
        }
    };
    let engine = std::sync::Arc::new(app.engine);

    info!("eSign expiry sweeper starting, every {}s", app.sweep_interval.as_secs());

    let mut interval = tokio::time::interval(app.sweep_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }

        let engine = engine.clone();
        let res = tokio::task::spawn_blocking(move || {
            engine.expire_overdue(chrono::Utc::now().naive_utc())
        }).await;
        match res {
            Ok(Ok(0)) => debug!("No overdue documents"),
            Ok(Ok(n)) => info!("Expired {} overdue document(s)", n),
            Ok(Err(err)) => warn!("Expiry sweep failed: {} {}", err, err.detail()),
            Err(err) => error!("Expiry sweep panicked: {}", err),
        }
    }
}
