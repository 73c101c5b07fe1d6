//! High-level platform client: submission pipeline, stop/delete signals.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jobkit_monitor::{dispatch_notification, MonitorConfig, TaskMonitor};
use jobkit_types::{
    AccessScope, DiagOption, EnvVar, FlavorsByZone, FsStorage, ImageSpec, Notifier,
    ResourceBuffers, ResourceQueue, ResourceSpec, RetryOptions, StatusProbe, TaskEvent, TaskForm,
    TaskRecord, TaskRoleSpec, TaskState, ValidationError,
};
use serde_json::json;

use crate::service::{ClientError, PlatformService};
use crate::sign::Credentials;

const MAX_ACTIVE_DEADLINE_SECONDS: u64 = 99_999_999;
const MAX_DELAY_EXIT_SECONDS: u64 = 864_000;

/// Connection settings for one platform account.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// IAM user id of the caller; used to warn when touching other users' tasks.
    pub iam_user_id: i64,
    pub region: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(
        endpoint: impl Into<String>,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        iam_user_id: i64,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            iam_user_id,
            region: "cn-north-1".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Everything needed to create one custom task.
#[derive(Debug, Clone)]
pub struct TaskSubmission {
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub enable_range_type: AccessScope,
    pub image_repo: String,
    pub image_tag: String,
    /// Joined with newlines into the task entrypoint.
    pub commands: Vec<String>,
    pub default_queue_id: String,
    pub backup_queue_ids: Vec<String>,
    pub priority: u8,
    pub preemptible: bool,
    pub role_name: String,
    pub flavor_id: String,
    pub buffers: ResourceBuffers,
    pub fs_sub_paths: Vec<String>,
    pub envs: Vec<EnvVar>,
    pub active_deadline_hours: u64,
    pub delay_exit_minutes: u64,
    pub monitor: MonitorConfig,
    pub notify_on_submit: bool,
    pub notify_on_terminate: bool,
}

impl TaskSubmission {
    pub fn new(
        name: impl Into<String>,
        image_repo: impl Into<String>,
        image_tag: impl Into<String>,
        default_queue_id: impl Into<String>,
        flavor_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            tags: Vec::new(),
            enable_range_type: AccessScope::Public,
            image_repo: image_repo.into(),
            image_tag: image_tag.into(),
            commands: Vec::new(),
            default_queue_id: default_queue_id.into(),
            backup_queue_ids: Vec::new(),
            priority: 6,
            preemptible: false,
            role_name: "worker".to_string(),
            flavor_id: flavor_id.into(),
            buffers: ResourceBuffers::default(),
            fs_sub_paths: Vec::new(),
            envs: Vec::new(),
            active_deadline_hours: 240,
            delay_exit_minutes: 0,
            monitor: MonitorConfig::default(),
            notify_on_submit: true,
            notify_on_terminate: true,
        }
    }

    /// Reject malformed parameters before anything touches the network.
    fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::Empty("task name"));
        }
        if self.image_repo.is_empty() {
            return Err(ValidationError::Empty("image repo"));
        }
        if self.image_tag.is_empty() {
            return Err(ValidationError::Empty("image tag"));
        }
        if self.default_queue_id.is_empty() {
            return Err(ValidationError::Empty("default queue id"));
        }
        if self.flavor_id.is_empty() {
            return Err(ValidationError::Empty("flavor id"));
        }
        if self.role_name.is_empty() {
            return Err(ValidationError::Empty("role name"));
        }
        if !matches!(self.priority, 2 | 4 | 6) {
            return Err(ValidationError::Priority(self.priority));
        }
        if self.buffers.cpu < 0 || self.buffers.memory < 0 || self.buffers.volume < 0 {
            return Err(ValidationError::NegativeBuffer);
        }
        let deadline_seconds = self.active_deadline_hours.saturating_mul(3600);
        if deadline_seconds > MAX_ACTIVE_DEADLINE_SECONDS {
            return Err(ValidationError::OutOfRange {
                field: "active deadline seconds",
                min: 0,
                max: MAX_ACTIVE_DEADLINE_SECONDS,
                value: deadline_seconds,
            });
        }
        let delay_seconds = self.delay_exit_minutes.saturating_mul(60);
        if delay_seconds > MAX_DELAY_EXIT_SECONDS {
            return Err(ValidationError::OutOfRange {
                field: "delay exit seconds",
                min: 0,
                max: MAX_DELAY_EXIT_SECONDS,
                value: delay_seconds,
            });
        }
        for path in &self.fs_sub_paths {
            if !path.starts_with('/') {
                return Err(ValidationError::MountPath(path.clone()));
            }
        }
        Ok(())
    }
}

/// Client for one platform account. Owns a single signed HTTP session shared
/// by every submission and monitor it creates.
pub struct PlatformClient {
    service: Arc<PlatformService>,
    iam_user_id: i64,
    notifier: Option<Arc<dyn Notifier>>,
}

impl PlatformClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let credentials = Credentials::new(
            config.access_key_id,
            config.secret_access_key,
            config.region,
        );
        let service = PlatformService::new(
            config.endpoint,
            credentials,
            config.connect_timeout,
            config.request_timeout,
        )?;
        Ok(Self {
            service: Arc::new(service),
            iam_user_id: config.iam_user_id,
            notifier: None,
        })
    }

    /// Attach a notifier for submission/termination events.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Shared status probe, usable for monitors created outside `submit_task`.
    pub fn probe(&self) -> Arc<dyn StatusProbe> {
        Arc::clone(&self.service) as Arc<dyn StatusProbe>
    }

    /// Create a task in the best available queue and start tracking it.
    ///
    /// Validation happens before any remote call; the returned monitor owns
    /// the task's single poll loop.
    pub async fn submit_task(&self, submission: TaskSubmission) -> Result<TaskMonitor, ClientError> {
        submission.validate()?;

        let image_url = self
            .validate_image(&submission.image_repo, &submission.image_tag)
            .await?;
        let flavors_by_zone = self.service.list_flavors().await?;
        let queue = self.find_optimal_queue(&submission, &flavors_by_zone).await?;
        let gpu_type = flavors_by_zone
            .get(&queue.zone_id)
            .and_then(|zone| zone.get(&submission.flavor_id))
            .map(|flavor| flavor.gpu_type.clone())
            .unwrap_or_default();
        let storages = self
            .build_fs_storages(&submission.fs_sub_paths, &queue.id)
            .await?;

        let form = TaskForm {
            name: submission.name.clone(),
            description: submission.description.clone(),
            tags: submission.tags.clone(),
            enable_range_type: submission.enable_range_type,
            image_spec: ImageSpec::new(image_url),
            source_code_state: -1,
            entrypoint_path: submission.commands.join("\n"),
            resource_queue_id: queue.id.clone(),
            priority: submission.priority,
            preemptible: submission.preemptible,
            framework: "Custom".to_string(),
            task_role_specs: vec![TaskRoleSpec::single_replica(
                submission.role_name.clone(),
                ResourceSpec {
                    flavor_id: submission.flavor_id.clone(),
                    zone_id: queue.zone_id.clone(),
                    resource_slice: None,
                    gpu_type,
                },
            )],
            storages,
            diag_options: DiagOption::defaults(),
            retry_options: RetryOptions::disabled(),
            enable_tensorboard: false,
            tensorboard_path: String::new(),
            access_types: vec![submission.enable_range_type],
            access_user_ids: Vec::new(),
            code_source: String::new(),
            code_ori_path: String::new(),
            local_code_path: String::new(),
            remote_code_path: String::new(),
            envs: submission.envs.clone(),
            advance_args: serde_json::Map::new(),
            active_deadline_seconds: submission.active_deadline_hours * 3600,
            delay_exit_time_seconds: submission.delay_exit_minutes * 60,
        };
        let form_value =
            serde_json::to_value(&form).map_err(|e| ClientError::Decode(e.to_string()))?;

        let result = self.service.call_api("CreateCustomTask", &form_value).await?;
        let task_id = result
            .get("Id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if task_id.is_empty() {
            return Err(ClientError::Decode(
                "create response carries no task id".to_string(),
            ));
        }
        tracing::info!(task_id = %task_id, queue_id = %queue.id, "created task");

        let detail = self.service.query_task(&task_id).await?;
        let state = TaskState::from_wire(&detail.state).ok_or_else(|| {
            ClientError::Decode(format!("unknown task state `{}`", detail.state))
        })?;
        let mut record = TaskRecord::new(
            task_id,
            submission.name.clone(),
            state,
            detail.create_time.unwrap_or_else(Utc::now),
        );
        record.last_observed_at = Utc::now();

        if submission.notify_on_submit {
            dispatch_notification(self.notifier.as_deref(), TaskEvent::Submitted, &record).await;
        }
        let monitor_notifier = if submission.notify_on_terminate {
            self.notifier.clone()
        } else {
            None
        };
        Ok(TaskMonitor::spawn(
            record,
            self.probe(),
            monitor_notifier,
            submission.monitor.clone().sanitized(),
        ))
    }

    /// Send a stop signal. `false` for the refusals worth tolerating
    /// (unknown task, missing permission); other API failures propagate.
    pub async fn stop_task(&self, task_id: &str) -> Result<bool, ClientError> {
        let Some(detail) = self.inspect_before_signal(task_id).await? else {
            return Ok(false);
        };
        if TaskState::from_wire(&detail.state).is_some_and(TaskState::is_terminal) {
            tracing::warn!(task_id = %task_id, state = %detail.state, "stopping a task already in a terminal state");
        }
        match self
            .service
            .call_api(
                "StopCustomTask",
                &json!({ "Id": task_id, "EnableDiagnosis": false }),
            )
            .await
        {
            Ok(_) => {
                tracing::info!(task_id = %task_id, "requested task stop");
                Ok(true)
            }
            Err(error) => match &error {
                ClientError::Api { code, .. } if code == "UnauthorizedOperation" => {
                    tracing::error!(task_id = %task_id, %error, "stop refused");
                    Ok(false)
                }
                _ => Err(error),
            },
        }
    }

    /// Send a delete signal; same tolerance rules as `stop_task`, plus the
    /// platform's refusal to delete a task that has not finished.
    pub async fn delete_task(&self, task_id: &str) -> Result<bool, ClientError> {
        if self.inspect_before_signal(task_id).await?.is_none() {
            return Ok(false);
        }
        match self
            .service
            .call_api(
                "DeleteCustomTask",
                &json!({ "Id": task_id, "EnableDiagnosis": false }),
            )
            .await
        {
            Ok(_) => {
                tracing::info!(task_id = %task_id, "requested task delete");
                Ok(true)
            }
            Err(error) => match &error {
                ClientError::Api { code, .. }
                    if code == "UnauthorizedOperation" || code == "CustomTaskNotInTerminalState" =>
                {
                    tracing::error!(task_id = %task_id, %error, "delete refused");
                    Ok(false)
                }
                _ => Err(error),
            },
        }
    }

    async fn inspect_before_signal(
        &self,
        task_id: &str,
    ) -> Result<Option<jobkit_types::TaskDetail>, ClientError> {
        let detail = match self.service.query_task(task_id).await {
            Ok(detail) => detail,
            Err(ClientError::UnknownTask(_)) => {
                tracing::error!(task_id = %task_id, "task does not exist");
                return Ok(None);
            }
            Err(error) => return Err(error),
        };
        if detail.creator_user_id != self.iam_user_id {
            tracing::warn!(
                task_id = %task_id,
                creator = detail.creator_user_id,
                "signalling a task created by another user"
            );
        }
        Ok(Some(detail))
    }

    async fn validate_image(&self, repo: &str, tag: &str) -> Result<String, ClientError> {
        let model = self.service.get_image_repo(repo).await?;
        let url = format!("{repo}:{tag}");
        if !model.tags.contains(&url) {
            return Err(ClientError::UnknownImageTag {
                repo: repo.to_string(),
                tag: tag.to_string(),
            });
        }
        Ok(url)
    }

    /// Default queue when it has room under the buffers, otherwise the first
    /// vacant backup. Broken backups are logged and skipped; a full default
    /// queue is still the final fallback.
    async fn find_optimal_queue(
        &self,
        submission: &TaskSubmission,
        flavors_by_zone: &FlavorsByZone,
    ) -> Result<ResourceQueue, ClientError> {
        let is_vacant = |queue: &ResourceQueue| -> Result<bool, ClientError> {
            let zone_flavors = flavors_by_zone.get(&queue.zone_id).ok_or_else(|| {
                ClientError::Queue {
                    id: queue.id.clone(),
                    reason: format!("no schedulable flavors in zone `{}`", queue.zone_id),
                }
            })?;
            let flavor = zone_flavors.get(&submission.flavor_id).ok_or_else(|| {
                ClientError::Queue {
                    id: queue.id.clone(),
                    reason: format!(
                        "flavor {} not schedulable in zone `{}`",
                        submission.flavor_id, queue.zone_id
                    ),
                }
            })?;
            if flavor.deprecated {
                return Err(ClientError::Queue {
                    id: queue.id.clone(),
                    reason: format!("flavor {} is deprecated", flavor.id),
                });
            }
            if !queue.fit_flavor(flavor) {
                return Err(ClientError::Queue {
                    id: queue.id.clone(),
                    reason: format!("queue can never hold flavor {}", flavor.id),
                });
            }
            Ok(queue.is_vacant_for(flavor, submission.buffers))
        };

        let default_queue = self
            .service
            .get_resource_queue(&submission.default_queue_id)
            .await?;
        if is_vacant(&default_queue)? {
            return Ok(default_queue);
        }

        for backup_id in &submission.backup_queue_ids {
            let checked = match self.service.get_resource_queue(backup_id).await {
                Ok(queue) => is_vacant(&queue).map(|vacant| (vacant, queue)),
                Err(error) => Err(error),
            };
            match checked {
                Ok((true, queue)) => {
                    tracing::info!(queue_id = %queue.id, "using backup resource queue");
                    return Ok(queue);
                }
                Ok((false, _)) => {}
                Err(error) => {
                    tracing::warn!(queue_id = %backup_id, %error, "skipping backup queue");
                }
            }
        }
        // nothing vacant right now; queue behind the default and wait
        Ok(default_queue)
    }

    async fn build_fs_storages(
        &self,
        sub_paths: &[String],
        queue_id: &str,
    ) -> Result<Vec<FsStorage>, ClientError> {
        if sub_paths.is_empty() {
            return Ok(Vec::new());
        }
        let mount = self.service.get_fs_mount(queue_id).await?;
        let mut storages = Vec::with_capacity(sub_paths.len());
        for path in sub_paths {
            let read_only = if mount.read_write_directories.contains(path) {
                false
            } else if mount.read_only_directories.contains(path) {
                true
            } else {
                return Err(ClientError::UnknownMountPath(path.clone()));
            };
            storages.push(FsStorage {
                storage_type: mount.storage_type.clone(),
                mount_path: format!("/{}{}", mount.fs_name, path),
                fs_name: mount.fs_name.clone(),
                read_only,
                sub_path: path.trim_start_matches('/').to_string(),
                fs_id: mount.fs_id.clone(),
                fs_host_path: format!("/mnt/{}", mount.fs_name),
            });
        }
        Ok(storages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission() -> TaskSubmission {
        TaskSubmission::new("train-demo", "team/train", "v1", "q-1", "ml.gpu.8xa100")
    }

    #[test]
    fn default_submission_validates() {
        assert!(submission().validate().is_ok());
    }

    #[test]
    fn empty_name_is_rejected() {
        let mut s = submission();
        s.name = String::new();
        assert!(matches!(s.validate(), Err(ValidationError::Empty("task name"))));
    }

    #[test]
    fn priority_must_be_in_the_fixed_set() {
        let mut s = submission();
        s.priority = 5;
        assert!(matches!(s.validate(), Err(ValidationError::Priority(5))));
        s.priority = 2;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn deadline_and_delay_bounds_are_enforced() {
        let mut s = submission();
        s.active_deadline_hours = 30_000;
        assert!(matches!(s.validate(), Err(ValidationError::OutOfRange { .. })));

        let mut s = submission();
        s.delay_exit_minutes = 14_401;
        assert!(matches!(s.validate(), Err(ValidationError::OutOfRange { .. })));
        s.delay_exit_minutes = 14_400;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn mount_paths_must_be_absolute() {
        let mut s = submission();
        s.fs_sub_paths = vec!["/fs_users".to_string(), "scratch".to_string()];
        assert!(matches!(s.validate(), Err(ValidationError::MountPath(p)) if p == "scratch"));
    }

    #[test]
    fn negative_buffers_are_rejected() {
        let mut s = submission();
        s.buffers.memory = -1;
        assert!(matches!(s.validate(), Err(ValidationError::NegativeBuffer)));
    }
}
