//! Signed platform API service: the `?Action=` request envelope and typed
//! wrappers over the task, queue, flavor, image, and mount endpoints.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jobkit_types::{
    FlavorsByZone, FsMount, ImageRepo, ProbeError, ResourceQueue, StatusProbe, TaskDetail,
    TaskState, ValidationError,
};
use serde_json::json;

use crate::sign::{sign_request, Credentials};

const API_VERSION: &str = "2021-10-01";

/// Actions this service knows how to sign and dispatch.
const ACTIONS: &[&str] = &[
    "CreateCustomTask",
    "GetCustomTask",
    "ListCustomTasks",
    "StopCustomTask",
    "GetContainerLogs",
    "DeleteCustomTask",
    "GetCustomTaskInstances",
    "GetResourceQueue",
    "ListResourceQueues",
    "GetMetrics",
    "ListImageRepos",
    "GetImageRepo",
    "ListMountPoints",
    "ListFlavorsV2",
    "GetUserPfsFilesetPermission",
];

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("calling `{action}` failed: [{code}] {message}")]
    Api {
        action: String,
        code: String,
        message: String,
        status: u16,
    },
    #[error("unregistered api action `{0}`")]
    UnknownAction(String),
    #[error("custom task [{0}] does not exist")]
    UnknownTask(String),
    #[error("resource queue [{id}]: {reason}")]
    Queue { id: String, reason: String },
    #[error("image repo [{0}] does not exist")]
    UnknownImageRepo(String),
    #[error("`{tag}` does not exist in image repo [{repo}]")]
    UnknownImageTag { repo: String, tag: String },
    #[error("`{0}` is not a mounted shared-fs directory")]
    UnknownMountPath(String),
    #[error("no usable shared-fs mount for queue {0}")]
    NoFsMount(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response shape: {0}")]
    Decode(String),
}

/// One signed HTTP session against the platform API. Stateless besides the
/// connection pool; safe to share across every monitored task.
pub struct PlatformService {
    http: reqwest::Client,
    endpoint: String,
    host: String,
    credentials: Credentials,
}

impl PlatformService {
    pub fn new(
        endpoint: impl Into<String>,
        credentials: Credentials,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        let host = endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint,
            host,
            credentials,
        })
    }

    /// POST one action with a signed JSON body and unwrap the platform's
    /// response envelope: non-200 yields the embedded error, a 200 without
    /// `Result` is itself an error.
    pub async fn call_api(
        &self,
        action: &str,
        form: &serde_json::Value,
    ) -> Result<serde_json::Value, ClientError> {
        if !ACTIONS.contains(&action) {
            return Err(ClientError::UnknownAction(action.to_string()));
        }
        let body = serde_json::to_vec(form).map_err(|e| ClientError::Decode(e.to_string()))?;
        let signed = sign_request(
            &self.credentials,
            "POST",
            "/",
            &[("Action", action), ("Version", API_VERSION)],
            &self.host,
            "application/json",
            &body,
            Utc::now(),
        );

        let response = self
            .http
            .post(format!("{}/", self.endpoint))
            .query(&[("Action", action), ("Version", API_VERSION)])
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("X-Date", &signed.x_date)
            .header("X-Content-Sha256", &signed.content_sha256)
            .header("Authorization", &signed.authorization)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let payload: serde_json::Value = response.json().await?;
        if !status.is_success() {
            let error = &payload["ResponseMetadata"]["Error"];
            return Err(ClientError::Api {
                action: action.to_string(),
                code: error["Code"].as_str().unwrap_or_default().to_string(),
                message: error["Message"].as_str().unwrap_or_default().to_string(),
                status: status.as_u16(),
            });
        }
        match payload.get("Result") {
            Some(result) => Ok(result.clone()),
            None => Err(ClientError::Api {
                action: action.to_string(),
                code: "MissingResult".to_string(),
                message: "successful response but missing key `Result`".to_string(),
                status: status.as_u16(),
            }),
        }
    }

    pub async fn query_task(&self, task_id: &str) -> Result<TaskDetail, ClientError> {
        let result = self
            .call_api("GetCustomTask", &json!({ "Id": task_id }))
            .await
            .map_err(|error| match error {
                ClientError::Api { ref code, .. } if is_not_found(code) => {
                    ClientError::UnknownTask(task_id.to_string())
                }
                other => other,
            })?;
        serde_json::from_value(result).map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// Fetch one queue; queues without a role for the caller or not in the
    /// `Running` state are unusable.
    pub async fn get_resource_queue(&self, queue_id: &str) -> Result<ResourceQueue, ClientError> {
        let result = self
            .call_api("GetResourceQueue", &json!({ "Id": queue_id }))
            .await
            .map_err(|error| match error {
                ClientError::Api { ref code, .. } if is_not_found(code) => ClientError::Queue {
                    id: queue_id.to_string(),
                    reason: "does not exist".to_string(),
                },
                other => other,
            })?;
        let queue: ResourceQueue =
            serde_json::from_value(result).map_err(|e| ClientError::Decode(e.to_string()))?;
        if queue.role.is_empty() {
            return Err(ClientError::Queue {
                id: queue_id.to_string(),
                reason: "caller has no role in this queue".to_string(),
            });
        }
        if queue.state != "Running" {
            return Err(ClientError::Queue {
                id: queue_id.to_string(),
                reason: format!("invalid state `{}`", queue.state),
            });
        }
        Ok(queue)
    }

    /// Flatten the `ListFlavorsV2` zone/type nesting into zone -> id -> flavor.
    pub async fn list_flavors(&self) -> Result<FlavorsByZone, ClientError> {
        let result = self
            .call_api("ListFlavorsV2", &json!({ "DisplayType": "Scheduling" }))
            .await?;
        let mut flavors_by_zone = FlavorsByZone::new();
        let zones = result
            .get("List")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        for (zone_id, raw_zone_flavors) in zones {
            let mut zone_flavors = HashMap::new();
            let by_type = raw_zone_flavors
                .as_object()
                .cloned()
                .unwrap_or_default();
            for raw_type_flavors in by_type.values() {
                for raw_flavor in raw_type_flavors.as_array().into_iter().flatten() {
                    let mut flavor: jobkit_types::Flavor = serde_json::from_value(raw_flavor.clone())
                        .map_err(|e| ClientError::Decode(e.to_string()))?;
                    // the xni family is listed without its GPU type
                    if flavor.id.starts_with("ml.xni") {
                        flavor.gpu_type = "X3C".to_string();
                    }
                    zone_flavors.insert(flavor.id.clone(), flavor);
                }
            }
            flavors_by_zone.insert(zone_id, zone_flavors);
        }
        Ok(flavors_by_zone)
    }

    pub async fn get_image_repo(&self, repo: &str) -> Result<ImageRepo, ClientError> {
        let result = self
            .call_api("GetImageRepo", &json!({ "Id": repo }))
            .await
            .map_err(|error| match error {
                ClientError::Api { ref code, .. } if is_not_found(code) => {
                    ClientError::UnknownImageRepo(repo.to_string())
                }
                other => other,
            })?;
        serde_json::from_value(result).map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// First Running shared-fs mount visible to the queue, joined with the
    /// caller's directory permissions.
    pub async fn get_fs_mount(&self, queue_id: &str) -> Result<FsMount, ClientError> {
        let result = self
            .call_api(
                "ListMountPoints",
                &json!({ "StorageType": "Pfs", "ResourceQueueId": queue_id }),
            )
            .await?;
        let mounts = result
            .get("List")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        for raw_mount in mounts {
            if raw_mount.get("PfsId").is_none()
                || raw_mount.get("Status").and_then(|v| v.as_str()) != Some("Running")
            {
                continue;
            }
            let mut mount: FsMount = serde_json::from_value(raw_mount)
                .map_err(|e| ClientError::Decode(e.to_string()))?;
            let permissions = self
                .call_api(
                    "GetUserPfsFilesetPermission",
                    &json!({ "PfsIds": [mount.fs_id.clone()] }),
                )
                .await?;
            let directories = &permissions["PfsIdToDirectories"][&mount.fs_id];
            mount.read_write_directories = string_list(&directories["ReadWriteDirectories"]);
            mount.read_only_directories = string_list(&directories["ReadOnlyDirectories"]);
            return Ok(mount);
        }
        tracing::error!(queue_id = %queue_id, "no Running shared-fs mount in ListMountPoints response");
        Err(ClientError::NoFsMount(queue_id.to_string()))
    }
}

fn is_not_found(code: &str) -> bool {
    code == "InvalidParameter" || code == "ResourceNotFound"
}

fn string_list(value: &serde_json::Value) -> Vec<String> {
    value
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_str())
        .map(String::from)
        .collect()
}

/// Retry classification for the monitor: network trouble and server-side
/// hiccups are worth retrying, everything else is not.
fn classify_probe_error(error: ClientError) -> ProbeError {
    match &error {
        ClientError::Http(_) => ProbeError::Transient(error.to_string()),
        ClientError::Api { status, code, .. }
            if *status >= 500
                || code.starts_with("Throttling")
                || code == "ServiceUnavailable"
                || code == "InternalError" =>
        {
            ProbeError::Transient(error.to_string())
        }
        _ => ProbeError::Permanent(error.to_string()),
    }
}

#[async_trait]
impl StatusProbe for PlatformService {
    async fn get_status(&self, task_id: &str) -> Result<TaskState, ProbeError> {
        let detail = self
            .query_task(task_id)
            .await
            .map_err(classify_probe_error)?;
        TaskState::from_wire(&detail.state).ok_or_else(|| {
            ProbeError::Permanent(format!(
                "task {task_id} reported a state outside the protocol: `{}`",
                detail.state
            ))
        })
    }
}
