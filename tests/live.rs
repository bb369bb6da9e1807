use std::sync::{Arc, Mutex};

use tado_throttle::{Config, Coordinator, TadoApi, TadoHttpClient, Update};

fn live_client() -> Arc<TadoHttpClient> {
    let home_id: u64 = std::env::var("TADO_HOME_ID")
        .expect("TADO_HOME_ID not set")
        .parse()
        .expect("TADO_HOME_ID must be numeric");
    let token = std::env::var("TADO_TOKEN").expect("TADO_TOKEN not set");
    Arc::new(
        TadoHttpClient::builder(home_id)
            .bearer_token(token)
            .build()
            .expect("client should build"),
    )
}

/// Run with: cargo test --test live -- --ignored
/// Requires TADO_HOME_ID and a valid access token in TADO_TOKEN.
/// Costs a handful of calls from the daily quota.
#[tokio::test]
#[ignore]
async fn fetch_zones_and_quota() {
    let api = live_client();

    let zones = api.get_zones().await.expect("get_zones failed");
    assert!(!zones.is_empty(), "home should have at least one zone");

    let states = api.get_zone_states().await.expect("get_zone_states failed");
    for zone in &zones {
        assert!(
            states.contains_key(&zone.id),
            "zone {} missing from zoneStates",
            zone.id
        );
    }

    let quota = api.quota().expect("tado should send quota headers");
    assert!(quota.limit > 0);
}

#[tokio::test]
#[ignore]
async fn coordinator_first_refresh() {
    let updates: Arc<Mutex<Vec<Update>>> = Arc::new(Mutex::new(vec![]));
    let updates_clone = updates.clone();

    let coordinator = Coordinator::builder(Config::default(), live_client())
        .on_update(move |u| updates_clone.lock().unwrap().push(u.clone()))
        .build()
        .expect("build failed");

    coordinator.start().await.expect("first refresh failed");

    assert!(!coordinator.read_state().zones.is_empty());
    assert!(coordinator.rate_limit().limit > 0);
    assert!(
        updates
            .lock()
            .unwrap()
            .iter()
            .any(|u| matches!(u, Update::Refreshed))
    );

    coordinator.shutdown();
}
