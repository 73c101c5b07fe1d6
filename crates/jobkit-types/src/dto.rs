//! Wire DTOs for the platform's PascalCase JSON API.
//!
//! Send-side models carry the auto-filled constants the task API expects;
//! receive-side models tolerate the platform's ""-means-unset timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Visibility scope for a task (who can see it in the console).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessScope {
    Public,
    Private,
}

/// Container image reference for a task.
#[derive(Debug, Clone, Serialize)]
pub struct ImageSpec {
    #[serde(rename = "Url")]
    pub url: String,
    #[serde(rename = "Type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl ImageSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: None,
        }
    }
}

/// Compute resources requested for one task role.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSpec {
    #[serde(rename = "FlavorID")]
    pub flavor_id: String,
    #[serde(rename = "ZoneId")]
    pub zone_id: String,
    #[serde(rename = "ResourceSlice", skip_serializing_if = "Option::is_none")]
    pub resource_slice: Option<HashMap<String, i64>>,
    #[serde(rename = "GPUType")]
    pub gpu_type: String,
}

/// One role of a task. Single replica, never restarted; the platform retries
/// nothing on our behalf.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRoleSpec {
    #[serde(rename = "RoleName")]
    pub role_name: String,
    #[serde(rename = "RoleReplicas")]
    pub role_replicas: u32,
    #[serde(rename = "ResourceSpec")]
    pub resource_spec: ResourceSpec,
    #[serde(rename = "RoleMinReplicas")]
    pub role_min_replicas: u32,
    #[serde(rename = "RoleMaxFailed")]
    pub role_max_failed: u32,
    #[serde(rename = "RoleRestartPolicy")]
    pub role_restart_policy: String,
    #[serde(rename = "RoleRestartMaxRetryCount")]
    pub role_restart_max_retry_count: u32,
}

impl TaskRoleSpec {
    pub fn single_replica(role_name: impl Into<String>, resource_spec: ResourceSpec) -> Self {
        Self {
            role_name: role_name.into(),
            role_replicas: 1,
            resource_spec,
            role_min_replicas: 1,
            role_max_failed: 0,
            role_restart_policy: "Never".to_string(),
            role_restart_max_retry_count: 0,
        }
    }
}

/// Shared parallel-filesystem mount attached to a task.
#[derive(Debug, Clone, Serialize)]
pub struct FsStorage {
    #[serde(rename = "Type")]
    pub storage_type: String,
    #[serde(rename = "MountPath")]
    pub mount_path: String,
    #[serde(rename = "PfsName")]
    pub fs_name: String,
    #[serde(rename = "ReadOnly")]
    pub read_only: bool,
    #[serde(rename = "SubPath")]
    pub sub_path: String,
    #[serde(rename = "PfsId")]
    pub fs_id: String,
    #[serde(rename = "PfsHostPath")]
    pub fs_host_path: String,
}

/// Diagnostic probe toggle. The task API wants all three present.
#[derive(Debug, Clone, Serialize)]
pub struct DiagOption {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Enable")]
    pub enable: bool,
}

impl DiagOption {
    /// The fixed probe set the API expects, all disabled.
    pub fn defaults() -> Vec<DiagOption> {
        ["HostPing", "PythonDetection", "LogDetection"]
            .into_iter()
            .map(|name| DiagOption {
                name: name.to_string(),
                enable: false,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryOptions {
    #[serde(rename = "EnableRetry")]
    pub enable_retry: bool,
}

impl RetryOptions {
    pub fn disabled() -> Self {
        Self { enable_retry: false }
    }
}

/// Environment variable injected into the task container.
#[derive(Debug, Clone, Serialize)]
pub struct EnvVar {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value")]
    pub value: String,
    #[serde(rename = "IsPrivate")]
    pub is_private: bool,
}

/// Full `CreateCustomTask` request body.
#[derive(Debug, Clone, Serialize)]
pub struct TaskForm {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,
    #[serde(rename = "EnableRangeType")]
    pub enable_range_type: AccessScope,
    #[serde(rename = "ImageSpec")]
    pub image_spec: ImageSpec,
    #[serde(rename = "SourceCodeState")]
    pub source_code_state: i32,
    #[serde(rename = "EntrypointPath")]
    pub entrypoint_path: String,
    #[serde(rename = "ResourceQueueId")]
    pub resource_queue_id: String,
    #[serde(rename = "Priority")]
    pub priority: u8,
    #[serde(rename = "Preemptible")]
    pub preemptible: bool,
    #[serde(rename = "Framework")]
    pub framework: String,
    #[serde(rename = "TaskRoleSpecs")]
    pub task_role_specs: Vec<TaskRoleSpec>,
    #[serde(rename = "Storages")]
    pub storages: Vec<FsStorage>,
    #[serde(rename = "DiagOptions")]
    pub diag_options: Vec<DiagOption>,
    #[serde(rename = "RetryOptions")]
    pub retry_options: RetryOptions,
    #[serde(rename = "EnableTensorBoard")]
    pub enable_tensorboard: bool,
    #[serde(rename = "TensorBoardPath")]
    pub tensorboard_path: String,
    #[serde(rename = "AccessTypes")]
    pub access_types: Vec<AccessScope>,
    #[serde(rename = "AccessUserIds")]
    pub access_user_ids: Vec<i64>,
    #[serde(rename = "CodeSource")]
    pub code_source: String,
    #[serde(rename = "CodeOriPath")]
    pub code_ori_path: String,
    #[serde(rename = "LocalCodePath")]
    pub local_code_path: String,
    #[serde(rename = "RemoteCodePath")]
    pub remote_code_path: String,
    #[serde(rename = "Envs")]
    pub envs: Vec<EnvVar>,
    #[serde(rename = "AdvanceArgs")]
    pub advance_args: serde_json::Map<String, serde_json::Value>,
    #[serde(rename = "ActiveDeadlineSeconds")]
    pub active_deadline_seconds: u64,
    #[serde(rename = "DelayExitTimeSeconds")]
    pub delay_exit_time_seconds: u64,
}

/// Aggregate quota numbers for a resource queue.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaItem {
    #[serde(rename = "VCPU")]
    pub vcpu: i64,
    #[serde(rename = "Memory")]
    pub memory: i64,
    #[serde(rename = "GPUResources", default)]
    pub gpu_resources: HashMap<String, i64>,
    #[serde(rename = "RdmaEniCount", default)]
    pub rdma_eni_count: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolumeItem {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Num")]
    pub num: i64,
    #[serde(rename = "ZoneId")]
    pub zone_id: String,
    #[serde(rename = "Name")]
    pub name: String,
}

/// Hardware flavor category. `HpcGpu` flavors run on dedicated clusters and
/// never fit a shared queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum FlavorKind {
    General,
    Compute,
    MemoryOptimized,
    #[serde(rename = "GPU")]
    Gpu,
    #[serde(rename = "HpcGPU")]
    HpcGpu,
}

/// One schedulable hardware flavor.
#[derive(Debug, Clone, Deserialize)]
pub struct Flavor {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Type")]
    pub kind: FlavorKind,
    #[serde(rename = "Deprecated", default)]
    pub deprecated: bool,
    #[serde(rename = "SupportVolumeTypeId", default)]
    pub support_volume_type_id: String,
    #[serde(rename = "vCPU")]
    pub vcpu: i64,
    #[serde(rename = "Memory")]
    pub memory: i64,
    #[serde(rename = "GPUType", default)]
    pub gpu_type: String,
    #[serde(rename = "GPUMemory", default)]
    pub gpu_memory: i64,
    #[serde(rename = "GPUNum", default)]
    pub gpu_num: i64,
    #[serde(rename = "MaxSlicesPerGPU", default)]
    pub max_slices_per_gpu: i64,
    #[serde(rename = "EniCount", default)]
    pub eni_count: i64,
    #[serde(rename = "NetQuota", default)]
    pub net_quota: String,
}

/// Zone id -> flavor id -> flavor, as flattened from `ListFlavorsV2`.
pub type FlavorsByZone = HashMap<String, HashMap<String, Flavor>>;

/// Headroom to leave in a queue when judging whether a flavor fits now.
#[derive(Debug, Clone, Copy)]
pub struct ResourceBuffers {
    pub cpu: i64,
    pub memory: i64,
    pub volume: i64,
}

impl Default for ResourceBuffers {
    fn default() -> Self {
        Self {
            cpu: 0,
            memory: 0,
            volume: 5,
        }
    }
}

/// A resource queue and its current allocation.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceQueue {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Description", default)]
    pub description: String,
    #[serde(rename = "ClusterId", default)]
    pub cluster_id: String,
    #[serde(rename = "ZoneId")]
    pub zone_id: String,
    #[serde(rename = "DevZoneId", default)]
    pub dev_zone_id: String,
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "Role", default)]
    pub role: String,
    #[serde(rename = "ResourceGroupId", default)]
    pub resource_group_id: String,
    #[serde(rename = "CapableFlavorTypes", default)]
    pub capable_flavor_types: String,
    #[serde(rename = "Shareable", default)]
    pub shareable: bool,
    #[serde(rename = "SupportMGPU", default)]
    pub support_mgpu: bool,
    #[serde(rename = "QuotaCapability")]
    pub quota_capability: QuotaItem,
    #[serde(rename = "QuotaAllocated")]
    pub quota_allocated: QuotaItem,
    #[serde(rename = "VolumeCapability", default)]
    pub volume_capability: Vec<VolumeItem>,
    #[serde(rename = "VolumeAllocated", default)]
    pub volume_allocated: Vec<VolumeItem>,
}

impl ResourceQueue {
    pub fn total_cpu(&self) -> i64 {
        self.quota_capability.vcpu
    }

    pub fn vacant_cpu(&self) -> i64 {
        self.quota_capability.vcpu - self.quota_allocated.vcpu
    }

    pub fn total_memory(&self) -> i64 {
        self.quota_capability.memory
    }

    pub fn vacant_memory(&self) -> i64 {
        self.quota_capability.memory - self.quota_allocated.memory
    }

    pub fn total_gpu(&self, gpu_type: &str) -> i64 {
        self.quota_capability
            .gpu_resources
            .get(gpu_type)
            .copied()
            .unwrap_or(0)
    }

    pub fn vacant_gpu(&self, gpu_type: &str) -> i64 {
        let allocated = self
            .quota_allocated
            .gpu_resources
            .get(gpu_type)
            .copied()
            .unwrap_or(0);
        self.total_gpu(gpu_type) - allocated
    }

    pub fn vacant_volume(&self) -> i64 {
        let total: i64 = self.volume_capability.iter().map(|v| v.num).sum();
        let allocated: i64 = self.volume_allocated.iter().map(|v| v.num).sum();
        total - allocated
    }

    /// Whether the queue's total capacity can ever hold the flavor.
    pub fn fit_flavor(&self, flavor: &Flavor) -> bool {
        if flavor.kind == FlavorKind::HpcGpu {
            return false;
        }
        let cpu_ok = self.total_cpu() >= flavor.vcpu;
        let memory_ok = self.total_memory() >= flavor.memory;
        let gpu_ok =
            flavor.kind != FlavorKind::Gpu || self.total_gpu(&flavor.gpu_type) >= flavor.gpu_num;
        cpu_ok && memory_ok && gpu_ok
    }

    /// Whether currently vacant resources allow the flavor with the given headroom.
    pub fn is_vacant_for(&self, flavor: &Flavor, buffers: ResourceBuffers) -> bool {
        if flavor.kind == FlavorKind::HpcGpu {
            return false;
        }
        let gpu_ok =
            flavor.kind != FlavorKind::Gpu || self.vacant_gpu(&flavor.gpu_type) >= flavor.gpu_num;
        let cpu_ok = self.vacant_cpu() >= flavor.vcpu + buffers.cpu;
        let memory_ok = self.vacant_memory() >= flavor.memory + buffers.memory;
        let volume_ok = self.vacant_volume() >= buffers.volume;
        gpu_ok && cpu_ok && memory_ok && volume_ok
    }
}

/// Shared-filesystem mount point visible to a queue, joined with the user's
/// directory permissions.
#[derive(Debug, Clone, Deserialize)]
pub struct FsMount {
    #[serde(rename = "StorageType")]
    pub storage_type: String,
    #[serde(rename = "PfsName")]
    pub fs_name: String,
    #[serde(rename = "PfsId")]
    pub fs_id: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "ReadWriteDirectories", default)]
    pub read_write_directories: Vec<String>,
    #[serde(rename = "ReadOnlyDirectories", default)]
    pub read_only_directories: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageRepo {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Namespace", default)]
    pub namespace: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Preset", default)]
    pub preset: bool,
    #[serde(rename = "CreateTime", default)]
    pub create_time: String,
    #[serde(rename = "UpdateTime", default)]
    pub update_time: String,
    #[serde(rename = "Purposes", default)]
    pub purposes: Vec<String>,
    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,
    #[serde(rename = "Domain", default)]
    pub domain: String,
    #[serde(rename = "Labels", default)]
    pub labels: Vec<String>,
    #[serde(rename = "Registry", default)]
    pub registry: String,
}

/// `GetCustomTask` response: everything the platform reports about one task.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskDetail {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Description", default)]
    pub description: String,
    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "CacheType", default)]
    pub cache_type: String,
    #[serde(rename = "ClusterId", default)]
    pub cluster_id: String,
    #[serde(rename = "CreatorUserId", default)]
    pub creator_user_id: i64,
    #[serde(rename = "ResourceGroupId", default)]
    pub resource_group_id: String,
    #[serde(rename = "ResourceQueueId", default)]
    pub resource_queue_id: String,
    #[serde(rename = "DiagInfo", default)]
    pub diag_info: String,
    #[serde(rename = "ExitCode", default)]
    pub exit_code: i64,
    #[serde(rename = "HasPermission", default)]
    pub has_permission: bool,
    #[serde(rename = "CreateTime", default, deserialize_with = "wire_time::option")]
    pub create_time: Option<DateTime<Utc>>,
    #[serde(rename = "LaunchTime", default, deserialize_with = "wire_time::option")]
    pub launch_time: Option<DateTime<Utc>>,
    #[serde(rename = "FinishTime", default, deserialize_with = "wire_time::option")]
    pub finish_time: Option<DateTime<Utc>>,
    #[serde(rename = "UpdateTime", default, deserialize_with = "wire_time::option")]
    pub update_time: Option<DateTime<Utc>>,
}

/// The platform serializes unset timestamps as `""` rather than null.
mod wire_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

    pub fn option<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        if raw.is_empty() {
            return Ok(None);
        }
        NaiveDateTime::parse_from_str(&raw, FORMAT)
            .map(|naive| Some(naive.and_utc()))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gpu_flavor() -> Flavor {
        serde_json::from_value(json!({
            "Name": "A100 x8",
            "Id": "ml.gpu.8xa100",
            "Type": "GPU",
            "Deprecated": false,
            "vCPU": 96,
            "Memory": 768,
            "GPUType": "A100",
            "GPUNum": 8
        }))
        .unwrap()
    }

    fn queue(vcpu: (i64, i64), memory: (i64, i64), gpus: (i64, i64), volumes: (i64, i64)) -> ResourceQueue {
        serde_json::from_value(json!({
            "Id": "q-1",
            "Name": "shared",
            "ZoneId": "zone-a",
            "State": "Running",
            "Role": "User",
            "QuotaCapability": {
                "VCPU": vcpu.0, "Memory": memory.0,
                "GPUResources": { "A100": gpus.0 }, "RdmaEniCount": 0
            },
            "QuotaAllocated": {
                "VCPU": vcpu.1, "Memory": memory.1,
                "GPUResources": { "A100": gpus.1 }, "RdmaEniCount": 0
            },
            "VolumeCapability": [{ "Id": "v-1", "Num": volumes.0, "ZoneId": "zone-a", "Name": "ssd" }],
            "VolumeAllocated": [{ "Id": "v-1", "Num": volumes.1, "ZoneId": "zone-a", "Name": "ssd" }]
        }))
        .unwrap()
    }

    #[test]
    fn queue_vacancy_arithmetic() {
        let q = queue((192, 96), (1536, 768), (16, 8), (20, 10));
        assert_eq!(q.vacant_cpu(), 96);
        assert_eq!(q.vacant_memory(), 768);
        assert_eq!(q.vacant_gpu("A100"), 8);
        assert_eq!(q.vacant_gpu("H100"), 0);
        assert_eq!(q.vacant_volume(), 10);
    }

    #[test]
    fn vacancy_respects_buffers() {
        let q = queue((192, 96), (1536, 768), (16, 8), (20, 10));
        let flavor = gpu_flavor();
        assert!(q.fit_flavor(&flavor));
        assert!(q.is_vacant_for(&flavor, ResourceBuffers::default()));
        // a cpu buffer larger than the headroom tips the decision
        assert!(!q.is_vacant_for(
            &flavor,
            ResourceBuffers {
                cpu: 1,
                memory: 0,
                volume: 5
            }
        ));
        // volume buffer beyond what's left
        assert!(!q.is_vacant_for(
            &flavor,
            ResourceBuffers {
                cpu: 0,
                memory: 0,
                volume: 11
            }
        ));
    }

    #[test]
    fn hpc_gpu_flavor_never_fits() {
        let q = queue((1024, 0), (8192, 0), (64, 0), (50, 0));
        let mut flavor = gpu_flavor();
        flavor.kind = FlavorKind::HpcGpu;
        assert!(!q.fit_flavor(&flavor));
        assert!(!q.is_vacant_for(&flavor, ResourceBuffers::default()));
    }

    #[test]
    fn task_form_serializes_wire_shape() {
        let form = TaskForm {
            name: "train-demo".to_string(),
            description: String::new(),
            tags: vec!["demo".to_string()],
            enable_range_type: AccessScope::Public,
            image_spec: ImageSpec::new("registry.example/train:v1"),
            source_code_state: -1,
            entrypoint_path: "python train.py".to_string(),
            resource_queue_id: "q-1".to_string(),
            priority: 6,
            preemptible: false,
            framework: "Custom".to_string(),
            task_role_specs: vec![TaskRoleSpec::single_replica(
                "worker",
                ResourceSpec {
                    flavor_id: "ml.gpu.8xa100".to_string(),
                    zone_id: "zone-a".to_string(),
                    resource_slice: None,
                    gpu_type: "A100".to_string(),
                },
            )],
            storages: Vec::new(),
            diag_options: DiagOption::defaults(),
            retry_options: RetryOptions::disabled(),
            enable_tensorboard: false,
            tensorboard_path: String::new(),
            access_types: vec![AccessScope::Public],
            access_user_ids: Vec::new(),
            code_source: String::new(),
            code_ori_path: String::new(),
            local_code_path: String::new(),
            remote_code_path: String::new(),
            envs: vec![EnvVar {
                name: "RUN_ID".to_string(),
                value: "42".to_string(),
                is_private: false,
            }],
            advance_args: serde_json::Map::new(),
            active_deadline_seconds: 864_000,
            delay_exit_time_seconds: 0,
        };
        let v = serde_json::to_value(&form).unwrap();
        assert_eq!(v["Name"], "train-demo");
        assert_eq!(v["SourceCodeState"], -1);
        assert_eq!(v["RetryOptions"]["EnableRetry"], false);
        assert_eq!(v["AccessTypes"], json!(["Public"]));
        assert_eq!(v["Framework"], "Custom");
        assert_eq!(v["TaskRoleSpecs"][0]["RoleRestartPolicy"], "Never");
        assert_eq!(v["TaskRoleSpecs"][0]["RoleReplicas"], 1);
        assert_eq!(v["TaskRoleSpecs"][0]["ResourceSpec"]["FlavorID"], "ml.gpu.8xa100");
        assert_eq!(v["DiagOptions"].as_array().unwrap().len(), 3);
        assert_eq!(v["Envs"][0]["IsPrivate"], false);
        // unset optionals stay off the wire
        assert!(v["ImageSpec"].get("Type").is_none());
    }

    #[test]
    fn task_detail_parses_empty_timestamps() {
        let detail: TaskDetail = serde_json::from_value(json!({
            "Id": "t-abc",
            "Name": "train-demo",
            "State": "Running",
            "CreatorUserId": 1001,
            "CreateTime": "2024-06-01T08:30:00Z",
            "LaunchTime": "2024-06-01T08:31:12Z",
            "FinishTime": "",
            "UpdateTime": ""
        }))
        .unwrap();
        assert_eq!(detail.state, "Running");
        assert!(detail.create_time.is_some());
        assert!(detail.launch_time.is_some());
        assert!(detail.finish_time.is_none());
        assert!(detail.update_time.is_none());
    }
}
