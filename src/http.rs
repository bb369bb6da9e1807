use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::HeaderMap;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace};

use crate::protocol::{
    DEFAULT_BASE_URL, WireDevice, WireHomeState, WireZone, WireZoneStates,
    away_configuration_body, bulk_overlay_body, bulk_resume_query, child_lock_body,
    enabled_body, meter_reading_body, offset_body, parse_away_temperature, parse_capabilities,
    presence_lock_body,
};
use crate::remote::{TEMP_OFFSET_ATTR, TadoApi};
use crate::types::*;
use crate::{Error, Result};

pub const DEFAULT_ENERGY_URL: &str = "https://energy-insights.tado.com/api";

pub struct TadoHttpClientBuilder {
    home_id: u64,
    base_url: String,
    energy_url: String,
    token: Option<String>,
}

impl TadoHttpClientBuilder {
    pub fn new(home_id: u64) -> Self {
        Self {
            home_id,
            base_url: DEFAULT_BASE_URL.to_string(),
            energy_url: DEFAULT_ENERGY_URL.to_string(),
            token: None,
        }
    }

    /// Overrides the API root, e.g. to route through a proxy.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn energy_url(mut self, url: impl Into<String>) -> Self {
        self.energy_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn build(self) -> Result<TadoHttpClient> {
        let http = reqwest::Client::builder().build()?;
        Ok(TadoHttpClient {
            http,
            home_id: self.home_id,
            base_url: self.base_url,
            energy_url: self.energy_url,
            token: Mutex::new(self.token),
            quota: Mutex::new(None),
        })
    }
}

/// `reqwest` implementation of [`TadoApi`]. Authentication is the caller's
/// concern; a fresh token can be swapped in with `set_token`.
pub struct TadoHttpClient {
    http: reqwest::Client,
    home_id: u64,
    base_url: String,
    energy_url: String,
    token: Mutex<Option<String>>,
    quota: Mutex<Option<RateLimit>>,
}

impl TadoHttpClient {
    pub fn builder(home_id: u64) -> TadoHttpClientBuilder {
        TadoHttpClientBuilder::new(home_id)
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.into());
    }

    fn home_url(&self, path: &str) -> String {
        format!("{}/homes/{}{}", self.base_url, self.home_id, path)
    }

    fn device_url(&self, serial: &str, path: &str) -> String {
        format!("{}/devices/{}{}", self.base_url, serial, path)
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        debug!(%method, url, "tado request");
        let mut req: RequestBuilder = self.http.request(method, url);
        if let Some(token) = self.token.lock().unwrap_or_else(|e| e.into_inner()).as_deref() {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;

        if let Some(quota) = parse_quota(resp.headers()) {
            trace!(limit = quota.limit, remaining = quota.remaining, "quota headers");
            *self.quota.lock().unwrap_or_else(|e| e.into_inner()) = Some(quota);
        }

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    async fn get_value(&self, url: &str) -> Result<Value> {
        let resp = self.send(Method::GET, url, None).await?;
        let text = resp.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        Ok(serde_json::from_value(self.get_value(url).await?)?)
    }

    async fn put(&self, url: &str, body: &Value) -> Result<()> {
        self.send(Method::PUT, url, Some(body)).await?;
        Ok(())
    }
}

/// Reads the quota from either the IETF draft headers
/// (`RateLimit-Policy: "perday";q=20000`, `RateLimit: "perday";r=19000`) or
/// the `X-RateLimit-*` pair. Both limit and remaining must be present.
pub fn parse_quota(headers: &HeaderMap) -> Option<RateLimit> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let limit = header("ratelimit-policy")
        .and_then(|v| parameter(v, "q"))
        .or_else(|| header("x-ratelimit-limit").and_then(|v| v.trim().parse().ok()))?;
    let remaining = header("ratelimit")
        .and_then(|v| parameter(v, "r"))
        .or_else(|| header("x-ratelimit-remaining").and_then(|v| v.trim().parse().ok()))?;

    Some(RateLimit { limit, remaining })
}

fn parameter(value: &str, name: &str) -> Option<u32> {
    value.split(';').find_map(|part| {
        let (k, v) = part.trim().split_once('=')?;
        (k.trim() == name).then(|| v.trim().parse().ok()).flatten()
    })
}

#[async_trait]
impl TadoApi for TadoHttpClient {
    async fn get_zones(&self) -> Result<Vec<Zone>> {
        let wire: Vec<WireZone> = self.get_json(&self.home_url("/zones")).await?;
        Ok(wire.into_iter().map(Zone::from).collect())
    }

    async fn get_devices(&self) -> Result<Vec<Device>> {
        let wire: Vec<WireDevice> = self.get_json(&self.home_url("/devices")).await?;
        Ok(wire.into_iter().map(Device::from).collect())
    }

    async fn get_capabilities(&self, zone: ZoneId) -> Result<Capabilities> {
        let v = self
            .get_value(&self.home_url(&format!("/zones/{zone}/capabilities")))
            .await?;
        Ok(parse_capabilities(&v))
    }

    async fn get_home_state(&self) -> Result<HomeState> {
        let wire: WireHomeState = self.get_json(&self.home_url("/state")).await?;
        Ok(wire.into())
    }

    async fn get_zone_states(&self) -> Result<BTreeMap<ZoneId, ZoneState>> {
        let wire: WireZoneStates = self.get_json(&self.home_url("/zoneStates")).await?;
        Ok(wire.into_states())
    }

    async fn get_device_info(&self, serial: &str, attr: &str) -> Result<Value> {
        self.get_value(&self.device_url(serial, &format!("/{attr}")))
            .await
    }

    async fn get_away_configuration(&self, zone: ZoneId) -> Result<Option<f64>> {
        let v = self
            .get_value(&self.home_url(&format!("/zones/{zone}/schedule/awayConfiguration")))
            .await?;
        Ok(parse_away_temperature(&v))
    }

    async fn set_presence(&self, presence: Presence) -> Result<()> {
        let url = self.home_url("/presenceLock");
        match presence {
            Presence::Auto => {
                self.send(Method::DELETE, &url, None).await?;
                Ok(())
            }
            p => self.put(&url, &presence_lock_body(p)).await,
        }
    }

    async fn set_child_lock(&self, serial: &str, enabled: bool) -> Result<()> {
        self.put(&self.device_url(serial, "/childLock"), &child_lock_body(enabled))
            .await
    }

    async fn set_temperature_offset(&self, serial: &str, offset: f64) -> Result<()> {
        self.put(
            &self.device_url(serial, &format!("/{TEMP_OFFSET_ATTR}")),
            &offset_body(offset),
        )
        .await
    }

    async fn set_away_configuration(&self, zone: ZoneId, temperature: f64) -> Result<()> {
        self.put(
            &self.home_url(&format!("/zones/{zone}/schedule/awayConfiguration")),
            &away_configuration_body(temperature),
        )
        .await
    }

    async fn set_dazzle_mode(&self, zone: ZoneId, enabled: bool) -> Result<()> {
        self.put(&self.home_url(&format!("/zones/{zone}/dazzle")), &enabled_body(enabled))
            .await
    }

    async fn set_early_start(&self, zone: ZoneId, enabled: bool) -> Result<()> {
        self.put(&self.home_url(&format!("/zones/{zone}/earlyStart")), &enabled_body(enabled))
            .await
    }

    async fn set_open_window_detection(&self, zone: ZoneId, enabled: bool) -> Result<()> {
        self.put(
            &self.home_url(&format!("/zones/{zone}/openWindowDetection")),
            &enabled_body(enabled),
        )
        .await
    }

    async fn identify_device(&self, serial: &str) -> Result<()> {
        self.send(Method::POST, &self.device_url(serial, "/identify"), None)
            .await?;
        Ok(())
    }

    async fn reset_all_zones_overlay(&self, zones: &[ZoneId]) -> Result<()> {
        if zones.is_empty() {
            return Ok(());
        }
        let url = format!("{}?rooms={}", self.home_url("/overlay"), bulk_resume_query(zones));
        self.send(Method::DELETE, &url, None).await?;
        Ok(())
    }

    async fn set_all_zones_overlay(&self, overlays: &[(ZoneId, ZoneOverlay)]) -> Result<()> {
        if overlays.is_empty() {
            return Ok(());
        }
        self.send(Method::POST, &self.home_url("/overlay"), Some(&bulk_overlay_body(overlays)))
            .await?;
        Ok(())
    }

    async fn add_meter_reading(&self, reading: u32, date: Option<NaiveDate>) -> Result<()> {
        let url = format!("{}/homes/{}/meterReadings", self.energy_url, self.home_id);
        self.send(Method::POST, &url, Some(&meter_reading_body(reading, date)))
            .await?;
        Ok(())
    }

    fn quota(&self) -> Option<RateLimit> {
        *self.quota.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, HeaderValue::from_static(v));
        }
        h
    }

    #[test]
    fn quota_from_draft_headers() {
        let h = headers(&[
            ("ratelimit-policy", "\"perday\";q=20000;w=86400"),
            ("ratelimit", "\"perday\";r=19876;t=3600"),
        ]);
        assert_eq!(
            parse_quota(&h),
            Some(RateLimit {
                limit: 20000,
                remaining: 19876
            })
        );
    }

    #[test]
    fn quota_from_x_headers() {
        let h = headers(&[("x-ratelimit-limit", "100"), ("x-ratelimit-remaining", "7")]);
        assert_eq!(
            parse_quota(&h),
            Some(RateLimit {
                limit: 100,
                remaining: 7
            })
        );
    }

    #[test]
    fn quota_requires_both_values() {
        assert_eq!(parse_quota(&headers(&[("x-ratelimit-limit", "100")])), None);
        assert_eq!(parse_quota(&HeaderMap::new()), None);
    }
}
