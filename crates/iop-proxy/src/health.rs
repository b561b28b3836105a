//! Upstream health monitoring.
//!
//! Every 30 seconds each route's target is probed with a 5 second
//! budget. Three consecutive failures flip a route to unhealthy; a
//! single success restores it. The failure streak lives here, not in
//! the snapshot, so only transitions touch the state store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use iop_common::api::HealthStatus;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::ProxyError;
use crate::state::StateStore;

const PROBE_INTERVAL: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const STRIKES_TO_UNHEALTHY: u32 = 3;
/// Concurrent probes per sweep.
const PROBE_POOL: usize = 8;

pub struct HealthMonitor {
    store: StateStore,
    client: reqwest::Client,
    streaks: Mutex<HashMap<String, u32>>,
}

impl HealthMonitor {
    pub fn new(store: StateStore) -> Result<Arc<Self>, ProxyError> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::configuration(format!("health probe client: {e}")))?;
        Ok(Arc::new(Self {
            store,
            client,
            streaks: Mutex::new(HashMap::new()),
        }))
    }

    /// Run the initial sweep, then tick forever.
    pub fn start(self: &Arc<Self>) {
        let monitor = self.clone();
        tokio::spawn(async move {
            monitor.sweep().await;
            let mut tick = tokio::time::interval(PROBE_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await; // immediate first tick already consumed by the sweep above
            loop {
                tick.tick().await;
                monitor.sweep().await;
            }
        });
    }

    /// Probe every route once, with bounded concurrency.
    pub async fn sweep(&self) {
        let routes: Vec<(String, String, String)> = self
            .store
            .read(|state| {
                state
                    .routes
                    .iter()
                    .map(|(host, route)| {
                        (host.clone(), route.target.clone(), route.health_path.clone())
                    })
                    .collect()
            })
            .await;

        let results: Vec<(String, bool)> = futures::stream::iter(routes)
            .map(|(host, target, path)| {
                let client = self.client.clone();
                async move {
                    let ok = probe(&client, &target, &path).await;
                    (host, ok)
                }
            })
            .buffer_unordered(PROBE_POOL)
            .collect()
            .await;

        for (host, ok) in results {
            self.apply(&host, ok).await;
        }
    }

    async fn apply(&self, host: &str, ok: bool) {
        let streak = {
            let mut streaks = self.streaks.lock().await;
            if ok {
                streaks.remove(host);
                0
            } else {
                let entry = streaks.entry(host.to_string()).or_insert(0);
                *entry += 1;
                *entry
            }
        };

        let new_status = if ok {
            HealthStatus::Healthy
        } else if streak >= STRIKES_TO_UNHEALTHY {
            HealthStatus::Unhealthy
        } else {
            debug!(host, streak, "[HEALTH] probe failed");
            return;
        };

        let previous = self
            .store
            .read(|state| state.routes.get(host).map(|r| r.health))
            .await;
        let Some(previous) = previous else {
            return; // route removed mid-sweep
        };
        if previous == new_status {
            return;
        }

        let result = self
            .store
            .mutate(|state| {
                if let Some(route) = state.routes.get_mut(host) {
                    route.health = new_status;
                }
            })
            .await;

        match result {
            Ok(()) => match new_status {
                HealthStatus::Healthy => info!(host, "[HEALTH] upstream healthy"),
                HealthStatus::Unhealthy => {
                    warn!(host, streak, "[HEALTH] upstream unhealthy, serving 503")
                }
                HealthStatus::Unknown => {}
            },
            Err(e) => warn!(host, "[HEALTH] could not persist transition: {e}"),
        }
    }

    /// Forget the failure streak for a removed host.
    pub async fn forget(&self, host: &str) {
        self.streaks.lock().await.remove(host);
    }
}

async fn probe(client: &reqwest::Client, target: &str, path: &str) -> bool {
    let url = format!("http://{target}{path}");
    match client.get(&url).send().await {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            debug!(target, "[HEALTH] probe error: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RouteRecord;

    async fn store_with_route(dir: &tempfile::TempDir) -> StateStore {
        let store = StateStore::open(dir.path().join("state.json")).await.unwrap();
        store
            .mutate(|state| {
                state.routes.insert(
                    "demo.example".to_string(),
                    RouteRecord {
                        target: "demo-web:3000".to_string(),
                        project: "demo".to_string(),
                        health_path: "/up".to_string(),
                        ssl: false,
                        health: HealthStatus::Unknown,
                        request_timeout_secs: None,
                    },
                );
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn three_strikes_then_unhealthy_one_success_restores() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_route(&dir).await;
        let monitor = HealthMonitor::new(store.clone()).unwrap();

        monitor.apply("demo.example", false).await;
        monitor.apply("demo.example", false).await;
        let health = store.read(|s| s.routes["demo.example"].health).await;
        assert_eq!(health, HealthStatus::Unknown);

        monitor.apply("demo.example", false).await;
        let health = store.read(|s| s.routes["demo.example"].health).await;
        assert_eq!(health, HealthStatus::Unhealthy);

        monitor.apply("demo.example", true).await;
        let health = store.read(|s| s.routes["demo.example"].health).await;
        assert_eq!(health, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn success_resets_the_streak() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_route(&dir).await;
        let monitor = HealthMonitor::new(store.clone()).unwrap();

        monitor.apply("demo.example", false).await;
        monitor.apply("demo.example", false).await;
        monitor.apply("demo.example", true).await;
        monitor.apply("demo.example", false).await;
        monitor.apply("demo.example", false).await;

        let health = store.read(|s| s.routes["demo.example"].health).await;
        assert_eq!(health, HealthStatus::Healthy);
    }
}
