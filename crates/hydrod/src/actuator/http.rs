use std::sync::Arc;

use async_trait::async_trait;
use hydro_core::{NodeAddress, RelayState};
use hydro_protocol::{ActuatorReply, FeedingStatusRequest};
use serde_json::Value;
use tracing::{debug, info};

use super::{ActuatorError, FailureKind, NodeActuator, RetryingClient};
use crate::config::NodePorts;
use crate::resolve::Resolver;

/// Node actuator API over HTTP.
///
/// Routes, relative to `http://<host>:<api_port><api_prefix>`:
/// `POST /valve_relay/{id}/{on|off}`, `GET /valve_relay/{id}/status` and
/// `POST /settings/feeding_status`.
pub struct HttpActuatorClient {
    client: RetryingClient,
    resolver: Arc<dyn Resolver>,
    api_port: u16,
    api_prefix: String,
}

impl HttpActuatorClient {
    pub fn new(client: RetryingClient, resolver: Arc<dyn Resolver>, ports: &NodePorts) -> Self {
        Self {
            client,
            resolver,
            api_port: ports.api,
            api_prefix: ports.api_prefix.trim_end_matches('/').to_string(),
        }
    }

    async fn url(&self, node: &NodeAddress, route: &str) -> Result<String, ActuatorError> {
        let host = self
            .resolver
            .resolve(node)
            .await
            .map_err(|source| ActuatorError::Unresolved {
                node: node.clone(),
                source,
            })?;
        Ok(format!(
            "http://{}{}{}",
            host.socket_addr(self.api_port),
            self.api_prefix,
            route
        ))
    }

    fn call_error(node: &NodeAddress, operation: String, kind: FailureKind) -> ActuatorError {
        ActuatorError::Call {
            node: node.clone(),
            operation,
            kind,
        }
    }
}

#[async_trait]
impl NodeActuator for HttpActuatorClient {
    async fn set_valve(
        &self,
        node: &NodeAddress,
        valve_id: u32,
        on: bool,
    ) -> Result<(), ActuatorError> {
        let action = if on { "on" } else { "off" };
        let url = self
            .url(node, &format!("/valve_relay/{valve_id}/{action}"))
            .await?;
        self.client
            .post(&url, None)
            .await
            .into_result()
            .map_err(|kind| Self::call_error(node, format!("valve {valve_id} {action}"), kind))?;
        info!(node = %node, valve = valve_id, action, "Valve switched");
        Ok(())
    }

    async fn valve_status(
        &self,
        node: &NodeAddress,
        valve_id: u32,
    ) -> Result<RelayState, ActuatorError> {
        let operation = || format!("valve {valve_id} status");
        let url = self
            .url(node, &format!("/valve_relay/{valve_id}/status"))
            .await?;
        let body = self
            .client
            .get(&url)
            .await
            .into_result()
            .map_err(|kind| Self::call_error(node, operation(), kind))?;
        let reply: ActuatorReply = serde_json::from_value(body)
            .map_err(|e| Self::call_error(node, operation(), FailureKind::Decode(e.to_string())))?;
        let state = reply.reported_state();
        debug!(node = %node, valve = valve_id, state = %state, "Valve status");
        Ok(state)
    }

    async fn set_feeding_status(
        &self,
        node: &NodeAddress,
        in_progress: bool,
    ) -> Result<(), ActuatorError> {
        let url = self.url(node, "/settings/feeding_status").await?;
        let body = serde_json::to_value(FeedingStatusRequest { in_progress })
            .unwrap_or(Value::Null);
        self.client
            .post(&url, Some(&body))
            .await
            .into_result()
            .map_err(|kind| {
                Self::call_error(node, format!("feeding_status={in_progress}"), kind)
            })?;
        debug!(node = %node, in_progress, "Feeding status updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::RetryPolicy;
    use crate::resolve::SystemResolver;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> HttpActuatorClient {
        let policy = RetryPolicy {
            max_attempts: 2,
            timeout: Duration::from_millis(500),
            backoff: Duration::from_millis(10),
        };
        let ports = NodePorts {
            api: server.address().port(),
            ..NodePorts::default()
        };
        HttpActuatorClient::new(
            RetryingClient::new(policy).unwrap(),
            Arc::new(SystemResolver::new("Garden")),
            &ports,
        )
    }

    #[tokio::test]
    async fn test_set_valve_hits_prefixed_route() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/valve_relay/3/off"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "success"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        client
            .set_valve(&NodeAddress::new("127.0.0.1"), 3, false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_valve_status_reads_relay_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/valve_relay/2/status"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": "success", "relay_status": "on"})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let state = client
            .valve_status(&NodeAddress::new("localhost"), 2)
            .await
            .unwrap();
        assert_eq!(state, RelayState::On);
    }

    #[tokio::test]
    async fn test_feeding_status_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/settings/feeding_status"))
            .and(body_json(json!({"in_progress": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "success"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        client
            .set_feeding_status(&NodeAddress::new("127.0.0.1"), true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejection_surfaces_as_call_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": "failure", "error": "no such relay"})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .set_valve(&NodeAddress::new("127.0.0.1"), 9, true)
            .await
            .unwrap_err();
        match err {
            ActuatorError::Call { kind, operation, .. } => {
                assert_eq!(kind, FailureKind::Rejected("no such relay".to_string()));
                assert_eq!(operation, "valve 9 on");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
