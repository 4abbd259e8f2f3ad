//! Execution units: remote workers that issue search requests on behalf of a
//! context.
//!
//! The [`UnitRegistry`] maps context labels to units, invokes them through a
//! [`UnitTransport`] under a [`RetryPolicy`], and forwards redeploy requests
//! to a [`Redeployer`] with at most one redeploy in flight per unit.

use crate::errors::{ConfigError, TransportError};
use crate::models::{ContextLabel, ExecutionUnit, SessionMaterial};
use crate::retry::RetryPolicy;
use crate::scrapers::SearchRequest;
use crate::utils::truncate_for_log;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Payload sent to a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationRequest {
    pub url: String,
    pub params: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
}

impl InvocationRequest {
    pub fn new(search: SearchRequest, session: &SessionMaterial) -> Self {
        Self {
            url: search.url,
            params: search.params,
            cookies: session.cookies.clone(),
            headers: session.headers.clone(),
        }
    }
}

/// What a unit answered. A non-2xx `status_code` is data, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InvocationResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    #[serde(default)]
    pub body: String,
}

#[derive(Deserialize)]
struct HtmlEnvelope {
    html_content: String,
}

impl InvocationResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// HTML of the response; bodies may be raw HTML or a JSON object with an
    /// `html_content` field.
    pub fn html(&self) -> Cow<'_, str> {
        let trimmed = self.body.trim_start();
        if trimmed.starts_with('{') {
            if let Ok(envelope) = serde_json::from_str::<HtmlEnvelope>(trimmed) {
                return Cow::Owned(envelope.html_content);
            }
        }
        Cow::Borrowed(&self.body)
    }
}

/// Sends one request to one unit.
#[async_trait]
pub trait UnitTransport: Send + Sync {
    async fn invoke(
        &self,
        unit: &ExecutionUnit,
        request: &InvocationRequest,
    ) -> Result<InvocationResponse, TransportError>;
}

/// Refreshes a unit out of band.
#[async_trait]
pub trait Redeployer: Send + Sync {
    async fn redeploy(
        &self,
        unit: &ExecutionUnit,
        label: &ContextLabel,
    ) -> Result<(), TransportError>;
}

/// Removes a unit from the in-flight set when the redeploy task ends, even
/// if it panicked.
struct InFlightEntry {
    set: Arc<Mutex<HashSet<String>>>,
    identity: String,
}

impl Drop for InFlightEntry {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.identity);
    }
}

pub struct UnitRegistry {
    units: BTreeMap<ContextLabel, ExecutionUnit>,
    transport: Arc<dyn UnitTransport>,
    redeployer: Arc<dyn Redeployer>,
    retry: RetryPolicy,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl UnitRegistry {
    pub fn new(
        units: BTreeMap<ContextLabel, ExecutionUnit>,
        transport: Arc<dyn UnitTransport>,
        redeployer: Arc<dyn Redeployer>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            units,
            transport,
            redeployer,
            retry,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Unit assigned to `label`.
    pub fn resolve(&self, label: &ContextLabel) -> Result<&ExecutionUnit, ConfigError> {
        self.units
            .get(label)
            .ok_or_else(|| ConfigError::MissingUnit(label.to_string()))
    }

    /// Invoke `unit`, retrying transient transport failures.
    #[instrument(level = "debug", skip_all, fields(unit = %unit.identity, url = %request.url))]
    pub async fn invoke(
        &self,
        unit: &ExecutionUnit,
        request: &InvocationRequest,
    ) -> Result<InvocationResponse, TransportError> {
        let response = self
            .retry
            .run(&unit.identity, TransportError::is_transient, || {
                self.transport.invoke(unit, request)
            })
            .await?;
        debug!(
            status = response.status_code,
            body = %truncate_for_log(&response.body, 200),
            "Unit responded"
        );
        Ok(response)
    }

    /// Ask for `unit` to be redeployed without waiting for it.
    ///
    /// Returns `false` when a redeploy of the same unit is already running.
    pub fn request_redeploy(&self, unit: &ExecutionUnit, label: &ContextLabel) -> bool {
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if !in_flight.insert(unit.identity.clone()) {
                debug!(unit = %unit.identity, context = %label, "Redeploy already in flight");
                return false;
            }
        }

        let entry = InFlightEntry {
            set: Arc::clone(&self.in_flight),
            identity: unit.identity.clone(),
        };
        let redeployer = Arc::clone(&self.redeployer);
        let unit = unit.clone();
        let label = label.clone();
        tokio::spawn(async move {
            let _entry = entry;
            match redeployer.redeploy(&unit, &label).await {
                Ok(()) => info!(unit = %unit.identity, context = %label, "Redeploy finished"),
                Err(e) => {
                    warn!(unit = %unit.identity, context = %label, error = %e, "Redeploy failed")
                }
            }
        });
        true
    }

    pub fn redeploys_in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Invokes units by POSTing the request as JSON to their endpoint.
pub struct HttpUnitTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpUnitTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, timeout })
    }

    async fn send(
        &self,
        unit: &ExecutionUnit,
        request: &InvocationRequest,
    ) -> Result<InvocationResponse, TransportError> {
        let resp = self.client.post(&unit.endpoint).json(request).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        let text = resp.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| TransportError::Decode(format!("{e}: {}", truncate_for_log(&text, 120))))
    }
}

#[async_trait]
impl UnitTransport for HttpUnitTransport {
    async fn invoke(
        &self,
        unit: &ExecutionUnit,
        request: &InvocationRequest,
    ) -> Result<InvocationResponse, TransportError> {
        tokio::time::timeout(self.timeout, self.send(unit, request))
            .await
            .map_err(|_| TransportError::Timeout)?
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RedeploySignal<'a> {
    context_label: &'a str,
    unit_identity: &'a str,
}

/// Sends redeploy signals to a webhook.
pub struct HttpRedeployer {
    client: reqwest::Client,
    webhook: String,
}

impl HttpRedeployer {
    pub fn new(webhook: impl Into<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            webhook: webhook.into(),
        })
    }
}

#[async_trait]
impl Redeployer for HttpRedeployer {
    async fn redeploy(
        &self,
        unit: &ExecutionUnit,
        label: &ContextLabel,
    ) -> Result<(), TransportError> {
        let signal = RedeploySignal {
            context_label: label.as_str(),
            unit_identity: &unit.identity,
        };
        let resp = self.client.post(&self.webhook).json(&signal).send().await?;
        if !resp.status().is_success() {
            return Err(TransportError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

/// Used when no redeploy webhook is configured.
pub struct LogOnlyRedeployer;

#[async_trait]
impl Redeployer for LogOnlyRedeployer {
    async fn redeploy(
        &self,
        unit: &ExecutionUnit,
        label: &ContextLabel,
    ) -> Result<(), TransportError> {
        warn!(
            unit = %unit.identity,
            location = %unit.location,
            context = %label,
            "Unit needs redeploy; no webhook configured"
        );
        Ok(())
    }
}
