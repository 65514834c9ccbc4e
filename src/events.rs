//! Container runtime events the control loops react to.
//!
//! The runtime's own event feed is an external collaborator; whatever
//! subscribes to it converts its messages into these types.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// One published port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
}

impl PortMapping {
    pub fn tcp(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
            protocol: Protocol::Tcp,
        }
    }

    pub fn udp(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
            protocol: Protocol::Udp,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Container address inside the guest.
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerAction {
    Start,
    Stop,
    Die,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerEvent {
    pub id: String,
    pub action: ContainerAction,
    #[serde(default)]
    pub network: NetworkSettings,
}

impl ContainerEvent {
    pub fn start(id: impl Into<String>, network: NetworkSettings) -> Self {
        Self {
            id: id.into(),
            action: ContainerAction::Start,
            network,
        }
    }

    pub fn stop(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: ContainerAction::Stop,
            network: NetworkSettings::default(),
        }
    }

    pub fn die(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: ContainerAction::Die,
            network: NetworkSettings::default(),
        }
    }
}

/// Task lifecycle events, as counted by the idle latch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum TaskEvent {
    Create { id: String },
    Delete { id: String },
}

impl TaskEvent {
    /// Change in the number of live tasks.
    pub fn delta(&self) -> i64 {
        match self {
            TaskEvent::Create { .. } => 1,
            TaskEvent::Delete { .. } => -1,
        }
    }
}
