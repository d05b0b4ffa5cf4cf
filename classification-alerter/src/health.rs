//! Deadline-based liveness for the long running loops of the service.
//!
//! Each loop registers a component and must keep reporting healthy more often
//! than its deadline. The process is healthy only while every registered
//! component is.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, has not reported yet
    Starting,
    /// Must report again before this instant
    HealthyUntil(Instant),
    Unhealthy,
    /// The HealthyUntil deadline passed
    Stalled,
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(Instant::now() + self.deadline));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut components) => {
                components.insert(self.component.clone(), status);
            }
            Err(_) => warn!("poisoned health registry lock"),
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    pub fn get_status(&self) -> HealthStatus {
        let components = match self.components.read() {
            Ok(components) => components,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();

        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };
        for (name, component) in components.iter() {
            let effective = match component {
                ComponentStatus::HealthyUntil(until) if *until > now => *component,
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => *other,
            };
            if !matches!(effective, ComponentStatus::HealthyUntil(_)) {
                status.healthy = false;
            }
            status.components.insert(name.clone(), effective);
        }

        if !status.healthy {
            warn!("{} health check failed: {:?}", self.name, status.components);
        }
        status
    }
}
