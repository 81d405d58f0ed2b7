//! Rendering cached records as Kubernetes pod objects
//!
//! The orchestrator only ever sees copies built here: the stored spec
//! snapshot with a `PodStatus` derived from the record.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
    ContainerStatus, Pod, PodCondition, PodIP, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use vk_apptainer_common::LifecycleState;

use crate::record::PodRecord;

pub const PHASE_PENDING: &str = "Pending";
pub const PHASE_RUNNING: &str = "Running";
pub const PHASE_SUCCEEDED: &str = "Succeeded";
pub const PHASE_FAILED: &str = "Failed";

/// Node-level facts stamped onto every rendered status
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    pub host_ip: Option<String>,
}

/// Kubernetes pod phase for a record
pub fn phase_of(record: &PodRecord) -> &'static str {
    match record.state {
        LifecycleState::Pending | LifecycleState::Creating => PHASE_PENDING,
        LifecycleState::Running | LifecycleState::Updating | LifecycleState::Terminating => {
            PHASE_RUNNING
        }
        LifecycleState::Terminated => PHASE_SUCCEEDED,
        LifecycleState::Failed => PHASE_FAILED,
    }
}

/// Copy of the spec snapshot with a freshly derived status
pub fn render_pod(record: &PodRecord, ctx: &RenderContext) -> Pod {
    let mut pod = (*record.spec).clone();
    pod.status = Some(render_status(record, ctx));
    pod
}

pub fn render_status(record: &PodRecord, ctx: &RenderContext) -> PodStatus {
    let ready = record.state == LifecycleState::Running;
    let transition = record
        .finished_at
        .or(record.started_at)
        .unwrap_or(record.created_at);

    let conditions = vec![
        condition("PodScheduled", true, record.created_at),
        condition("Initialized", true, record.created_at),
        condition("ContainersReady", ready, transition),
        condition("Ready", ready, transition),
    ];

    let (reason, message) = match record.state {
        LifecycleState::Failed => (
            record
                .last_error
                .as_deref()
                .map(reason_token)
                .or_else(|| record.exit.as_ref().map(|e| e.reason.clone())),
            record.last_error.clone(),
        ),
        _ => (None, None),
    };

    let pod_ips = ctx
        .host_ip
        .as_ref()
        .map(|ip| vec![PodIP { ip: ip.clone() }]);

    PodStatus {
        phase: Some(phase_of(record).to_string()),
        conditions: Some(conditions),
        container_statuses: Some(container_statuses(record)),
        host_ip: ctx.host_ip.clone(),
        pod_ip: ctx.host_ip.clone(),
        pod_ips,
        start_time: Some(Time(record.created_at)),
        reason,
        message,
        ..Default::default()
    }
}

fn condition(type_: &str, status: bool, at: DateTime<Utc>) -> PodCondition {
    PodCondition {
        type_: type_.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        last_transition_time: Some(Time(at)),
        ..Default::default()
    }
}

/// First word of an error message, usable as a CamelCase reason
fn reason_token(message: &str) -> String {
    message
        .split(|c: char| c == ':' || c.is_whitespace())
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("Error")
        .to_string()
}

fn container_statuses(record: &PodRecord) -> Vec<ContainerStatus> {
    let containers = record
        .spec
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or(&[]);

    containers
        .iter()
        .map(|c| ContainerStatus {
            name: c.name.clone(),
            image: c.image.clone().unwrap_or_default(),
            image_id: String::new(),
            container_id: record
                .remote_handle
                .as_ref()
                .map(|h| format!("apptainer://{}", h)),
            ready: record.state == LifecycleState::Running,
            started: Some(record.state.holds_handle() && record.started_at.is_some()),
            restart_count: 0,
            state: Some(container_state(record)),
            ..Default::default()
        })
        .collect()
}

fn container_state(record: &PodRecord) -> ContainerState {
    match record.state {
        LifecycleState::Pending | LifecycleState::Creating => ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some("ContainerCreating".to_string()),
                message: record.last_error.clone(),
            }),
            ..Default::default()
        },
        LifecycleState::Running | LifecycleState::Updating | LifecycleState::Terminating => {
            ContainerState {
                running: Some(ContainerStateRunning {
                    started_at: record.started_at.map(Time),
                }),
                ..Default::default()
            }
        }
        LifecycleState::Terminated | LifecycleState::Failed => {
            let exit_code = record
                .exit
                .as_ref()
                .and_then(|e| e.code)
                .unwrap_or(if record.state == LifecycleState::Failed { 1 } else { 0 });
            let reason = record
                .exit
                .as_ref()
                .map(|e| e.reason.clone())
                .unwrap_or_else(|| match record.state {
                    LifecycleState::Failed => "Error".to_string(),
                    _ => "ProviderDeleted".to_string(),
                });
            ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code,
                    reason: Some(reason),
                    message: record.last_error.clone(),
                    started_at: record.started_at.map(Time),
                    finished_at: record.finished_at.map(Time),
                    ..Default::default()
                }),
                ..Default::default()
            }
        }
    }
}
