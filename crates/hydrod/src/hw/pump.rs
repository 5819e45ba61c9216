//! Nutrient feed pump drivers.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use super::{open_output, DigitalOutput, HwError};
use crate::actuator::{RetryPolicy, RetryingClient};
use crate::config::FeedPumpConfig;

/// The feed pump, however it is wired.
#[async_trait]
pub trait PumpDriver: Send + Sync {
    async fn turn_on(&self) -> Result<(), HwError>;

    async fn turn_off(&self) -> Result<(), HwError>;

    async fn status(&self) -> Result<bool, HwError>;
}

/// Builds the driver described by the settings.
///
/// No configuration yields a [`DisabledPump`].
pub fn build_pump(
    config: Option<&FeedPumpConfig>,
    policy: RetryPolicy,
) -> Result<Arc<dyn PumpDriver>, HwError> {
    match config {
        None => Ok(Arc::new(DisabledPump)),
        Some(FeedPumpConfig::Io { io_number }) => {
            Ok(Arc::new(GpioPump::new(open_output(*io_number)?)))
        }
        Some(FeedPumpConfig::Shelly { ip }) => {
            let client = RetryingClient::new(policy).map_err(|e| HwError::SmartPlug {
                host: ip.clone(),
                reason: e.to_string(),
            })?;
            Ok(Arc::new(SmartPlugPump::new(ip.clone(), client)))
        }
    }
}

// ============================================================================
// GPIO
// ============================================================================

/// Pump switched by a GPIO output (high = running).
pub struct GpioPump {
    output: Box<dyn DigitalOutput>,
}

impl GpioPump {
    pub fn new(output: Box<dyn DigitalOutput>) -> Self {
        Self { output }
    }
}

#[async_trait]
impl PumpDriver for GpioPump {
    async fn turn_on(&self) -> Result<(), HwError> {
        self.output.write(true)?;
        info!("Feed pump on");
        Ok(())
    }

    async fn turn_off(&self) -> Result<(), HwError> {
        self.output.write(false)?;
        info!("Feed pump off");
        Ok(())
    }

    async fn status(&self) -> Result<bool, HwError> {
        self.output.read_back()
    }
}

// ============================================================================
// Smart plug
// ============================================================================

/// Pump plugged into a Shelly-compatible smart plug (`/relay/0?turn=...`).
pub struct SmartPlugPump {
    host: String,
    client: RetryingClient,
}

impl SmartPlugPump {
    pub fn new(host: impl Into<String>, client: RetryingClient) -> Self {
        Self {
            host: host.into(),
            client,
        }
    }

    fn base(&self) -> String {
        if self.host.starts_with("http://") || self.host.starts_with("https://") {
            self.host.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", self.host.trim_end_matches('/'))
        }
    }

    async fn relay(&self, query: &str) -> Result<bool, HwError> {
        let url = format!("{}/relay/0{}", self.base(), query);
        let body = self
            .client
            .get(&url)
            .await
            .into_result()
            .map_err(|kind| HwError::SmartPlug {
                host: self.host.clone(),
                reason: kind.to_string(),
            })?;
        body.get("ison")
            .and_then(Value::as_bool)
            .ok_or_else(|| HwError::SmartPlug {
                host: self.host.clone(),
                reason: "response has no ison field".to_string(),
            })
    }

    async fn switch(&self, on: bool) -> Result<(), HwError> {
        let turn = if on { "on" } else { "off" };
        let ison = self.relay(&format!("?turn={turn}")).await?;
        if ison != on {
            return Err(HwError::SmartPlug {
                host: self.host.clone(),
                reason: format!("plug reports ison={ison} after turn={turn}"),
            });
        }
        info!(host = %self.host, state = turn, "Feed pump plug switched");
        Ok(())
    }
}

#[async_trait]
impl PumpDriver for SmartPlugPump {
    async fn turn_on(&self) -> Result<(), HwError> {
        self.switch(true).await
    }

    async fn turn_off(&self) -> Result<(), HwError> {
        self.switch(false).await
    }

    async fn status(&self) -> Result<bool, HwError> {
        self.relay("").await
    }
}

// ============================================================================
// Not configured
// ============================================================================

/// Stand-in when no pump is configured. Switching off is a no-op so
/// shutdown paths stay clean; switching on fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledPump;

#[async_trait]
impl PumpDriver for DisabledPump {
    async fn turn_on(&self) -> Result<(), HwError> {
        Err(HwError::PumpNotConfigured)
    }

    async fn turn_off(&self) -> Result<(), HwError> {
        debug!("Feed pump not configured, nothing to turn off");
        Ok(())
    }

    async fn status(&self) -> Result<bool, HwError> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn plug(server: &MockServer) -> SmartPlugPump {
        let policy = RetryPolicy {
            max_attempts: 1,
            timeout: Duration::from_millis(500),
            backoff: Duration::from_millis(10),
        };
        SmartPlugPump::new(server.uri(), RetryingClient::new(policy).unwrap())
    }

    #[tokio::test]
    async fn test_smart_plug_turn_on() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/relay/0"))
            .and(query_param("turn", "on"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ison": true})))
            .expect(1)
            .mount(&server)
            .await;

        plug(&server).turn_on().await.unwrap();
    }

    #[tokio::test]
    async fn test_smart_plug_state_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/relay/0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ison": true})))
            .mount(&server)
            .await;

        let err = plug(&server).turn_off().await.unwrap_err();
        assert!(matches!(err, HwError::SmartPlug { .. }));
        assert!(plug(&server).status().await.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_pump() {
        let pump = DisabledPump;
        assert!(matches!(pump.turn_on().await, Err(HwError::PumpNotConfigured)));
        pump.turn_off().await.unwrap();
        assert!(!pump.status().await.unwrap());
    }

    #[tokio::test]
    async fn test_build_without_config_is_disabled() {
        let pump = build_pump(None, RetryPolicy::default()).unwrap();
        assert!(pump.turn_on().await.is_err());
    }
}
