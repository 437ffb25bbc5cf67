use std::collections::HashSet;
use std::time::Duration;

use common::config::ProbeConfig;
use serde::Serialize;

use crate::error::ProbeError;
use crate::message::OutboundMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Hold the next step back for a fixed time after this one is sent.
    Delay(Duration),
    /// Hold the next step back until any stdout data arrives after this one
    /// is sent.
    AnyData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub message: OutboundMessage,
    pub wait: WaitPolicy,
}

impl Step {
    pub const fn new(message: OutboundMessage, wait: WaitPolicy) -> Self {
        Self { message, wait }
    }
}

/// An immutable, ordered list of steps plus the delay before the first one.
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    start_delay: Duration,
    steps: Vec<Step>,
}

impl Script {
    pub fn new(start_delay: Duration, steps: Vec<Step>) -> Result<Self, ProbeError> {
        let mut seen = HashSet::new();
        for (index, step) in steps.iter().enumerate() {
            if let Some(id) = step.message.id() {
                if !seen.insert(id.clone()) {
                    return Err(ProbeError::InvalidScript(format!(
                        "step {} reuses request id {id}",
                        index + 1
                    )));
                }
            }
        }
        Ok(Self { start_delay, steps })
    }

    /// `initialize`, `initialized`, `tools/list`, and optionally
    /// `resources/list`.
    pub fn handshake(config: &ProbeConfig) -> Result<Self, ProbeError> {
        let params = InitializeParams {
            protocol_version: config.protocol_version.clone(),
            capabilities: serde_json::Map::new(),
            client_info: ClientInfo {
                name: config.client_name.clone(),
                version: config.client_version.clone(),
            },
        };
        let params = serde_json::to_value(params).map_err(ProbeError::Encoding)?;

        let mut steps = vec![
            Step::new(
                OutboundMessage::request(1, "initialize", Some(params)),
                WaitPolicy::AnyData,
            ),
            Step::new(
                OutboundMessage::notification("initialized", None),
                WaitPolicy::Delay(config.step_delay()),
            ),
            Step::new(
                OutboundMessage::request(2, "tools/list", None),
                WaitPolicy::Delay(Duration::ZERO),
            ),
        ];
        if config.discover_resources {
            if let Some(last) = steps.last_mut() {
                last.wait = WaitPolicy::Delay(config.step_delay());
            }
            steps.push(Step::new(
                OutboundMessage::request(3, "resources/list", None),
                WaitPolicy::Delay(Duration::ZERO),
            ));
        }
        Self::new(config.start_delay(), steps)
    }

    pub const fn start_delay(&self) -> Duration {
        self.start_delay
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub(crate) fn len(&self) -> usize {
        self.steps.len()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams {
    protocol_version: String,
    capabilities: serde_json::Map<String, serde_json::Value>,
    client_info: ClientInfo,
}

#[derive(Debug, Clone, Serialize)]
struct ClientInfo {
    name: String,
    version: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn handshake_has_three_ordered_steps() {
        let script = Script::handshake(&ProbeConfig::default()).expect("script");
        let methods: Vec<&str> = script.steps().iter().map(|s| s.message.method()).collect();
        assert_eq!(methods, vec!["initialize", "initialized", "tools/list"]);
        assert_eq!(script.steps()[0].wait, WaitPolicy::AnyData);
        assert_eq!(
            script.steps()[1].wait,
            WaitPolicy::Delay(Duration::from_millis(100))
        );
        assert_eq!(script.start_delay(), Duration::from_millis(100));
    }

    #[test]
    fn initialize_params_use_camel_case() {
        let script = Script::handshake(&ProbeConfig::default()).expect("script");
        let value = serde_json::to_value(&script.steps()[0].message).expect("serialize");
        assert_eq!(value["id"], 1);
        assert_eq!(value["params"]["protocolVersion"], "2024-11-05");
        assert_eq!(value["params"]["capabilities"], json!({}));
        assert_eq!(value["params"]["clientInfo"]["name"], "mcp-probe");
    }

    #[test]
    fn resource_discovery_appends_fourth_step() {
        let config = ProbeConfig {
            discover_resources: true,
            ..ProbeConfig::default()
        };
        let script = Script::handshake(&config).expect("script");
        assert_eq!(script.len(), 4);
        assert_eq!(script.steps()[3].message.method(), "resources/list");
        assert_eq!(
            script.steps()[2].wait,
            WaitPolicy::Delay(config.step_delay())
        );
    }

    #[test]
    fn duplicate_request_ids_are_rejected() {
        let steps = vec![
            Step::new(OutboundMessage::request(1, "a", None), WaitPolicy::AnyData),
            Step::new(OutboundMessage::notification("n", None), WaitPolicy::AnyData),
            Step::new(OutboundMessage::request(1, "b", None), WaitPolicy::AnyData),
        ];
        let err = Script::new(Duration::ZERO, steps).expect_err("duplicate id");
        assert!(err.to_string().contains("step 3 reuses request id 1"));
    }
}
