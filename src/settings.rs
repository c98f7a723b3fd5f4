use config::{Config, ConfigError};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

use crate::cidr::Ipv4Cidr;
use crate::error::StackError;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub stack: StackSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub service: ServiceSettings,
    #[serde(default)]
    pub registry: RegistrySettings,
    #[serde(default)]
    pub source: SourceSettings,
    #[serde(default)]
    pub build: BuildSettings,
    #[serde(default)]
    pub echo_server: EchoServerSettings,
    #[serde(default)]
    pub aws: AwsSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StackSettings {
    /// CloudFormation stack name, also used as the template description prefix
    #[serde(default = "default_stack_name")]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_stack_name() -> String {
    "ECSPipeline".to_string()
}

impl Default for StackSettings {
    fn default() -> Self {
        Self {
            name: default_stack_name(),
            description: None,
        }
    }
}

/// Placement tier of a subnet group
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubnetType {
    /// Default route to the internet gateway
    Public,
    /// Default route to a NAT gateway, no inbound path
    PrivateWithNat,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SubnetTierSettings {
    pub name: String,
    pub subnet_type: SubnetType,
    pub cidr_mask: u8,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkSettings {
    #[serde(default = "default_vpc_cidr")]
    pub cidr: Ipv4Cidr,
    #[serde(default = "default_max_azs")]
    pub max_azs: usize,
    #[serde(default = "default_nat_gateways")]
    pub nat_gateways: usize,
    #[serde(default = "default_subnet_tiers")]
    pub subnets: Vec<SubnetTierSettings>,
}

fn default_vpc_cidr() -> Ipv4Cidr {
    Ipv4Cidr::new(std::net::Ipv4Addr::new(10, 0, 0, 0), 16).unwrap_or_else(|_| unreachable!())
}

fn default_max_azs() -> usize {
    2
}

fn default_nat_gateways() -> usize {
    1
}

fn default_subnet_tiers() -> Vec<SubnetTierSettings> {
    vec![
        SubnetTierSettings {
            name: "public".to_string(),
            subnet_type: SubnetType::Public,
            cidr_mask: 24,
        },
        SubnetTierSettings {
            name: "private".to_string(),
            subnet_type: SubnetType::PrivateWithNat,
            cidr_mask: 24,
        },
    ]
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            cidr: default_vpc_cidr(),
            max_azs: default_max_azs(),
            nat_gateways: default_nat_gateways(),
            subnets: default_subnet_tiers(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceSettings {
    /// Fargate CPU units (256 = 0.25 vCPU)
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    #[serde(default = "default_memory_limit_mib")]
    pub memory_limit_mib: u32,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_container_name")]
    pub container_name: String,
    #[serde(default = "default_container_port")]
    pub container_port: u16,
    #[serde(default = "default_desired_count")]
    pub desired_count: u32,
    #[serde(default = "default_health_check_grace_period_secs")]
    pub health_check_grace_period_secs: u32,
    /// Name of the second target group the external deployment controller
    /// shifts traffic onto
    #[serde(default = "default_secondary_target_group_name")]
    pub secondary_target_group_name: String,
}

fn default_cpu() -> u32 {
    256
}

fn default_memory_limit_mib() -> u32 {
    512
}

fn default_image() -> String {
    "httpd".to_string()
}

fn default_container_name() -> String {
    "web".to_string()
}

fn default_container_port() -> u16 {
    80
}

fn default_desired_count() -> u32 {
    1
}

fn default_health_check_grace_period_secs() -> u32 {
    60
}

fn default_secondary_target_group_name() -> String {
    "ecsTargetGroup".to_string()
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            memory_limit_mib: default_memory_limit_mib(),
            image: default_image(),
            container_name: default_container_name(),
            container_port: default_container_port(),
            desired_count: default_desired_count(),
            health_check_grace_period_secs: default_health_check_grace_period_secs(),
            secondary_target_group_name: default_secondary_target_group_name(),
        }
    }
}

fn default_repository_name() -> String {
    "echo-server".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistrySettings {
    #[serde(default = "default_repository_name")]
    pub repository_name: String,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            repository_name: default_repository_name(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceSettings {
    #[serde(default = "default_repository_name")]
    pub repository_name: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            repository_name: default_repository_name(),
            branch: default_branch(),
        }
    }
}

/// CodeBuild compute sizes
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ComputeType {
    #[serde(rename = "small")]
    Small,
    #[serde(rename = "medium")]
    Medium,
    #[serde(rename = "large")]
    Large,
    #[serde(rename = "x2-large")]
    X2Large,
}

impl ComputeType {
    pub fn as_cfn(&self) -> &'static str {
        match self {
            ComputeType::Small => "BUILD_GENERAL1_SMALL",
            ComputeType::Medium => "BUILD_GENERAL1_MEDIUM",
            ComputeType::Large => "BUILD_GENERAL1_LARGE",
            ComputeType::X2Large => "BUILD_GENERAL1_2XLARGE",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BuildSettings {
    #[serde(default = "default_compute_type")]
    pub compute_type: ComputeType,
    #[serde(default = "default_build_image")]
    pub build_image: String,
    /// Required to run the Docker daemon inside the build container
    #[serde(default = "default_privileged")]
    pub privileged: bool,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u32,
    #[serde(default = "default_concurrent_build_limit")]
    pub concurrent_build_limit: u32,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,
}

fn default_compute_type() -> ComputeType {
    ComputeType::Small
}

fn default_build_image() -> String {
    "aws/codebuild/standard:6.0".to_string()
}

fn default_privileged() -> bool {
    true
}

fn default_timeout_minutes() -> u32 {
    60
}

fn default_concurrent_build_limit() -> u32 {
    8
}

fn default_log_retention_days() -> u32 {
    30
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            compute_type: default_compute_type(),
            build_image: default_build_image(),
            privileged: default_privileged(),
            timeout_minutes: default_timeout_minutes(),
            concurrent_build_limit: default_concurrent_build_limit(),
            log_retention_days: default_log_retention_days(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EchoServerSettings {
    #[serde(default = "default_echo_host")]
    pub host: String,
    #[serde(default = "default_echo_port")]
    pub port: u16,
}

fn default_echo_host() -> String {
    "0.0.0.0".to_string()
}

fn default_echo_port() -> u16 {
    80
}

impl Default for EchoServerSettings {
    fn default() -> Self {
        Self {
            host: default_echo_host(),
            port: default_echo_port(),
        }
    }
}

/// Credentials and region for submitting the template.
/// Falls back to the default AWS credential chain when keys are not set.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AwsSettings {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

/// Retention periods CloudWatch Logs accepts
const LOG_RETENTION_DAYS: [u32; 22] = [
    1, 3, 5, 7, 14, 30, 60, 90, 120, 150, 180, 365, 400, 545, 731, 1096, 1827, 2192, 2557, 2922,
    3288, 3653,
];

/// Whether Fargate accepts the CPU/memory pair
pub fn is_valid_fargate_size(cpu: u32, memory_mib: u32) -> bool {
    let (min, max, step) = match cpu {
        256 => return matches!(memory_mib, 512 | 1024 | 2048),
        512 => (1024, 4096, 1024),
        1024 => (2048, 8192, 1024),
        2048 => (4096, 16384, 1024),
        4096 => (8192, 30720, 1024),
        8192 => (16384, 61440, 4096),
        16384 => (32768, 122880, 8192),
        _ => return false,
    };
    (min..=max).contains(&memory_mib) && memory_mib % step == 0
}

/// Expand `${NAME}` and `${NAME:-fallback}` references from the process
/// environment. Unset names without a fallback expand to nothing.
fn expand_env(raw: &str) -> String {
    let Ok(pattern) = regex::Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") else {
        return raw.to_string();
    };
    pattern
        .replace_all(raw, |caps: &regex::Captures| {
            env::var(&caps[1])
                .unwrap_or_else(|_| caps.get(2).map_or_else(String::new, |m| m.as_str().to_string()))
        })
        .into_owned()
}

/// Merged config tree as JSON, with string leaves env-expanded
fn layer_to_json(value: &config::Value) -> serde_json::Value {
    use config::ValueKind;
    use serde_json::Value as Json;

    match &value.kind {
        ValueKind::Nil => Json::Null,
        ValueKind::Boolean(b) => Json::from(*b),
        ValueKind::I64(i) => Json::from(*i),
        ValueKind::U64(u) => Json::from(*u),
        // out of range for JSON integers; deserialization reports the type
        ValueKind::I128(i) => i64::try_from(*i).map_or_else(|_| Json::from(i.to_string()), Json::from),
        ValueKind::U128(u) => u64::try_from(*u).map_or_else(|_| Json::from(u.to_string()), Json::from),
        ValueKind::Float(f) => Json::from(*f),
        ValueKind::String(s) => Json::from(expand_env(s)),
        ValueKind::Table(table) => Json::Object(
            table
                .iter()
                .map(|(key, v)| (key.clone(), layer_to_json(v)))
                .collect(),
        ),
        ValueKind::Array(items) => Json::Array(items.iter().map(layer_to_json).collect()),
    }
}

/// The first of `{name}.toml`, `{name}.yaml` or `{name}.yml` in `config_dir`
fn find_layer(config_dir: &Path, name: &str) -> Option<PathBuf> {
    let found = ["toml", "yaml", "yml"]
        .iter()
        .map(|ext| config_dir.join(format!("{}.{}", name, ext)))
        .find(|path| path.is_file());
    match &found {
        Some(path) => tracing::info!(path = %path.display(), "Loading config layer"),
        None => tracing::debug!(dir = %config_dir.display(), layer = name, "No config layer"),
    }
    found
}

impl Settings {

    /// Load settings from `ECS_PIPELINE_CONFIG_DIR` (default `config`) for
    /// the mode in `ECS_PIPELINE_RUN_MODE` (default `development`)
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("ECS_PIPELINE_RUN_MODE").unwrap_or_else(|_| "development".into());
        let config_dir = env::var("ECS_PIPELINE_CONFIG_DIR").unwrap_or_else(|_| "config".into());
        Self::load_from(&config_dir, &run_mode)
    }

    /// Layer `default`, `{run_mode}` and `local` config files from
    /// `config_dir`, then `ECS_PIPELINE__SECTION__KEY` environment variables.
    /// Every file is optional; missing values fall back to built-in defaults.
    pub fn load_from(config_dir: &str, run_mode: &str) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        for name in ["default", run_mode, "local"] {
            if let Some(path) = find_layer(Path::new(config_dir), name) {
                builder = builder.add_source(config::File::from(path));
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("ECS_PIPELINE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;

        let root_value = config
            .cache
            .into_table()
            .map_err(|e| ConfigError::Message(format!("Failed to get config table: {}", e)))?;

        let json_value = serde_json::Value::Object(
            root_value
                .iter()
                .map(|(key, v)| (key.clone(), layer_to_json(v)))
                .collect(),
        );

        // Deserialize from JSON value and collect unused fields
        let mut unused_fields = Vec::new();
        let settings: Settings = serde_ignored::deserialize(json_value, |path| {
            unused_fields.push(path.to_string());
        })
        .map_err(|e| ConfigError::Message(format!("Failed to deserialize settings: {}", e)))?;

        for field in &unused_fields {
            tracing::warn!("Unknown configuration field: {}", field);
        }

        settings
            .validate()
            .map_err(|e| ConfigError::Message(e.to_string()))?;

        Ok(settings)
    }

    /// Check the values the stack is built from
    pub fn validate(&self) -> Result<(), StackError> {
        Self::require_non_empty("stack.name", &self.stack.name)?;
        if !self
            .stack
            .name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic())
            || !self
                .stack
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(StackError::invalid_setting(
                "stack.name",
                format!(
                    "'{}' must start with a letter and contain only letters, digits and '-'",
                    self.stack.name
                ),
            ));
        }

        let network = &self.network;
        if network.max_azs == 0 {
            return Err(StackError::invalid_setting("network.max_azs", "must be at least 1"));
        }
        if network.subnets.is_empty() {
            return Err(StackError::invalid_setting(
                "network.subnets",
                "at least one subnet tier is required",
            ));
        }
        let public_tiers = network
            .subnets
            .iter()
            .filter(|t| t.subnet_type == SubnetType::Public)
            .count();
        let has_private_tier = network
            .subnets
            .iter()
            .any(|t| t.subnet_type == SubnetType::PrivateWithNat);
        if public_tiers == 0 {
            return Err(StackError::invalid_setting(
                "network.subnets",
                "a public tier is required for the load balancer",
            ));
        }
        if !has_private_tier {
            return Err(StackError::invalid_setting(
                "network.subnets",
                "a private_with_nat tier is required for service tasks",
            ));
        }
        if network.nat_gateways == 0 {
            return Err(StackError::invalid_setting(
                "network.nat_gateways",
                "private_with_nat subnets need at least one NAT gateway",
            ));
        }
        if network.nat_gateways > public_tiers * network.max_azs {
            return Err(StackError::invalid_setting(
                "network.nat_gateways",
                format!(
                    "{} NAT gateways requested but only {} public subnets exist",
                    network.nat_gateways,
                    public_tiers * network.max_azs
                ),
            ));
        }
        let mut tier_names = std::collections::HashSet::new();
        for tier in &network.subnets {
            Self::require_non_empty("network.subnets.name", &tier.name)?;
            if !tier.name.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(StackError::invalid_setting(
                    "network.subnets.name",
                    format!("'{}' must be alphanumeric", tier.name),
                ));
            }
            if !tier_names.insert(tier.name.as_str()) {
                return Err(StackError::invalid_setting(
                    "network.subnets.name",
                    format!("duplicate subnet tier '{}'", tier.name),
                ));
            }
            if tier.cidr_mask <= network.cidr.prefix() || tier.cidr_mask > 28 {
                return Err(StackError::SubnetMaskTooWide {
                    name: tier.name.clone(),
                    mask: tier.cidr_mask,
                    block: network.cidr.to_string(),
                });
            }
        }

        let service = &self.service;
        if !is_valid_fargate_size(service.cpu, service.memory_limit_mib) {
            return Err(StackError::invalid_setting(
                "service.memory_limit_mib",
                format!(
                    "{} MiB is not a valid Fargate memory size for {} CPU units",
                    service.memory_limit_mib, service.cpu
                ),
            ));
        }
        Self::require_non_empty("service.image", &service.image)?;
        Self::require_non_empty("service.container_name", &service.container_name)?;
        if service.container_port == 0 {
            return Err(StackError::invalid_setting("service.container_port", "must not be 0"));
        }
        let tg_name = &service.secondary_target_group_name;
        if tg_name.is_empty()
            || tg_name.len() > 32
            || !tg_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(StackError::invalid_setting(
                "service.secondary_target_group_name",
                format!("'{}' must be 1-32 alphanumeric characters or '-'", tg_name),
            ));
        }

        Self::require_non_empty("registry.repository_name", &self.registry.repository_name)?;
        if self.registry.repository_name != self.registry.repository_name.to_lowercase() {
            return Err(StackError::invalid_setting(
                "registry.repository_name",
                "ECR repository names must be lowercase",
            ));
        }
        Self::require_non_empty("source.repository_name", &self.source.repository_name)?;
        Self::require_non_empty("source.branch", &self.source.branch)?;

        let build = &self.build;
        Self::require_non_empty("build.build_image", &build.build_image)?;
        if !(5..=2160).contains(&build.timeout_minutes) {
            return Err(StackError::invalid_setting(
                "build.timeout_minutes",
                format!("{} is outside 5..=2160", build.timeout_minutes),
            ));
        }
        if build.concurrent_build_limit == 0 {
            return Err(StackError::invalid_setting(
                "build.concurrent_build_limit",
                "must be at least 1",
            ));
        }
        if !LOG_RETENTION_DAYS.contains(&build.log_retention_days) {
            return Err(StackError::invalid_setting(
                "build.log_retention_days",
                format!(
                    "{} is not a CloudWatch Logs retention period",
                    build.log_retention_days
                ),
            ));
        }

        Ok(())
    }

    fn require_non_empty(field: &'static str, value: &str) -> Result<(), StackError> {
        if value.trim().is_empty() {
            return Err(StackError::invalid_setting(field, "must not be empty"));
        }
        Ok(())
    }
}
