use std::env;
use std::sync::Arc;
use std::time::Duration;

use tado_throttle::{Config, Coordinator, TadoHttpClient, Update};

#[tokio::main]
async fn main() -> tado_throttle::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let home_id: u64 = match args.get(1).and_then(|s| s.parse().ok()) {
        Some(id) => id,
        None => {
            eprintln!("usage: monitor <home-id> [config.toml]  (token in TADO_TOKEN)");
            std::process::exit(2);
        }
    };
    let config_path = args.get(2);
    let config = match config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let mut http = TadoHttpClient::builder(home_id);
    if let Ok(token) = env::var("TADO_TOKEN") {
        http = http.bearer_token(token);
    }
    if let Some(url) = &config.api_proxy_url {
        http = http.base_url(url);
    }
    let api = Arc::new(http.build()?);

    let mut builder = Coordinator::builder(config, api).on_update(|update| match update {
        Update::Refreshed => println!("refreshed"),
        Update::RefreshFailed { reason } => println!("refresh failed: {reason}"),
        Update::RateLimit { rate_limit, status } => println!(
            "quota {}/{} ({status})",
            rate_limit.remaining, rate_limit.limit
        ),
        Update::Optimistic { keys } => println!("optimistic: {keys:?}"),
        Update::PollingChanged { enabled } => println!("polling enabled: {enabled}"),
    });
    if let Some(path) = config_path {
        builder = builder.persist_config(path);
    }
    let coordinator = builder.build()?;

    println!("Fetching home {home_id}...");
    coordinator.start().await?;

    loop {
        let state = coordinator.read_state();
        for (id, zone) in &state.zones {
            let live = coordinator.zone_state(*id);
            let temp = live
                .as_ref()
                .and_then(|s| s.inside_temperature)
                .map(|t| format!("{t:.1}\u{00b0}C"))
                .unwrap_or_else(|| "--".into());
            let target = live
                .as_ref()
                .and_then(|s| s.setting.temperature)
                .map(|t| format!("{t:.1}\u{00b0}C"))
                .unwrap_or_else(|| "off".into());
            let overlay = if live.as_ref().is_some_and(|s| s.overlay_active()) {
                " | overlay"
            } else {
                ""
            };
            println!("[{}] {temp} -> {target}{overlay}", zone.name);
        }
        let decision = coordinator.next_interval();
        println!(
            "next poll: {:?} ({:?}), reset at {}",
            decision.interval,
            decision.reason,
            coordinator.next_reset_time()
        );
        tokio::time::sleep(Duration::from_secs(60)).await;
    }
}
