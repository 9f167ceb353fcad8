//! Skyform for AWS.
//!
//! [`Aws`] is the provider every AWS resource in this crate is applied with.
//! It holds one client per service behind an object-safe trait, so the same
//! resources run against the SDK or against an in-memory double.
use std::{future::Future, sync::Arc, time::Duration};

use aws_config::{BehaviorVersion, Region};
use snafu::prelude::*;

use crate::{
    api::{ApiError, Classify, ErrorClass},
    sweep::Sweepers,
    tags::{IgnoreConfig, KeyValueTags, TagError, TagService},
};

pub use aws_config::SdkConfig;

pub mod internetmonitor;
pub mod kafka;
pub mod ssmcontacts;
pub mod ssmincidents;

#[cfg(test)]
pub(crate) mod fake;

use internetmonitor::InternetMonitorApi;
use ssmcontacts::SsmContactsApi;
use ssmincidents::SsmIncidentsApi;

/// Region used when none is configured.
pub const DEFAULT_REGION: &str = "us-west-2";

/// How often a resource's status is polled while waiting on it.
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// How long a resource may take to reach a status.
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(60 * 5);

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("Could not read provider config {path:?}: {source}"))]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not parse provider config {path:?}: {source}"))]
    Parse {
        path: std::path::PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("No {service} client was configured"))]
    MissingClient { service: &'static str },
}

/// User settings shared by every resource of the provider.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Falls back to the environment's region, then [`DEFAULT_REGION`].
    pub region: Option<String>,
    /// Tags applied to every taggable resource, under the resource's own tags.
    pub default_tags: KeyValueTags,
    /// Tags the provider never reads back or changes.
    pub ignore_tags: IgnoreConfig,
}

impl ProviderConfig {
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        serde_json::from_str(&contents).context(ParseSnafu { path })
    }

    /// A config for the given region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

/// Errors of the AWS resources in this crate.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ResourceError {
    #[snafu(display("{verb} {kind} ({identifier}): {source}"))]
    Api {
        verb: &'static str,
        kind: &'static str,
        identifier: String,
        source: ApiError,
    },

    #[snafu(display("{kind} ({identifier}) {source}"))]
    Tags {
        kind: &'static str,
        identifier: String,
        source: TagError,
    },

    #[snafu(display(
        "waiting for {kind} ({identifier}) to become {status}: timed out after {seconds} seconds"
    ))]
    Timeout {
        kind: &'static str,
        identifier: String,
        status: String,
        seconds: u64,
    },

    #[snafu(display("{kind} ({identifier}) reached unexpected status {status}"))]
    UnexpectedStatus {
        kind: &'static str,
        identifier: String,
        status: String,
    },

    #[snafu(display("Could not resolve '{field}': {message}"))]
    Unresolved { field: &'static str, message: String },
}

impl Classify for ResourceError {
    fn class(&self) -> ErrorClass {
        match self {
            ResourceError::Api { source, .. } => source.class(),
            ResourceError::Tags { source, .. } => source.class(),
            _ => ErrorClass::Other,
        }
    }
}

impl ResourceError {
    /// Resolves a [`Remote`](crate::remote::Remote) field of a definition.
    pub(crate) fn resolve<X: Clone + core::fmt::Debug + 'static>(
        field: &'static str,
        remote: &crate::remote::Remote<X>,
    ) -> Result<X, Self> {
        remote.get().map_err(|e| ResourceError::Unresolved {
            field,
            message: e.to_string(),
        })
    }
}

/// Polls `status` until it returns `target`.
///
/// Any status other than `target` or one of `pending` is an error, as is still
/// pending after [`STATUS_TIMEOUT`].
pub(crate) async fn wait_for_status<F, Fut>(
    kind: &'static str,
    identifier: &str,
    target: &str,
    pending: &[&str],
    mut status: F,
) -> Result<(), ResourceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String, ResourceError>>,
{
    let start = std::time::Instant::now();
    log::info!("  awaiting {kind} ({identifier}) status {target}");
    loop {
        let current = status().await?;
        if current == target {
            return Ok(());
        }
        ensure!(
            pending.contains(&current.as_str()),
            UnexpectedStatusSnafu {
                kind,
                identifier,
                status: current
            }
        );
        ensure!(
            start.elapsed() < STATUS_TIMEOUT,
            TimeoutSnafu {
                kind,
                identifier,
                status: target,
                seconds: STATUS_TIMEOUT.as_secs()
            }
        );
        log::debug!("  {kind} ({identifier}) is {current}");
        tokio::time::sleep(STATUS_POLL_INTERVAL).await;
    }
}

/// The AWS provider: a region, the user's config and one client per
/// service.
#[derive(Clone)]
pub struct Aws {
    region: String,
    config: ProviderConfig,
    kafka: Arc<dyn TagService>,
    internet_monitor: Arc<dyn InternetMonitorApi>,
    ssm_contacts: Arc<dyn SsmContactsApi>,
    ssm_incidents: Arc<dyn SsmIncidentsApi>,
}

impl core::fmt::Debug for Aws {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aws")
            .field("region", &self.region)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Aws {
    /// Loads credentials and endpoints from the environment with the SDK's
    /// default chain.
    pub async fn load(config: ProviderConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = config.region.clone() {
            loader = loader.region(Region::new(region));
        }
        let sdk_config = loader.load().await;
        Self::from_sdk_config(&sdk_config, config)
    }

    pub fn from_sdk_config(sdk_config: &SdkConfig, config: ProviderConfig) -> Self {
        let region = sdk_config
            .region()
            .map(|r| r.as_ref().to_owned())
            .or_else(|| config.region.clone())
            .unwrap_or_else(|| DEFAULT_REGION.to_owned());
        log::debug!("creating AWS clients for {region}");
        Self {
            region,
            config,
            kafka: Arc::new(aws_sdk_kafka::Client::new(sdk_config)),
            internet_monitor: Arc::new(aws_sdk_internetmonitor::Client::new(sdk_config)),
            ssm_contacts: Arc::new(aws_sdk_ssmcontacts::Client::new(sdk_config)),
            ssm_incidents: Arc::new(aws_sdk_ssmincidents::Client::new(sdk_config)),
        }
    }

    /// Builds a provider from explicit clients.
    pub fn builder(region: impl Into<String>) -> AwsBuilder {
        AwsBuilder {
            region: region.into(),
            config: ProviderConfig::default(),
            kafka: None,
            internet_monitor: None,
            ssm_contacts: None,
            ssm_incidents: None,
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn kafka(&self) -> &dyn TagService {
        self.kafka.as_ref()
    }

    pub fn internet_monitor(&self) -> &dyn InternetMonitorApi {
        self.internet_monitor.as_ref()
    }

    pub fn ssm_contacts(&self) -> &dyn SsmContactsApi {
        self.ssm_contacts.as_ref()
    }

    pub fn ssm_incidents(&self) -> &dyn SsmIncidentsApi {
        self.ssm_incidents.as_ref()
    }

    /// Tags to send for a resource declaring `tags`: the default tags with
    /// the resource's on top, without ignored tags.
    pub fn tags_all(&self, tags: &KeyValueTags) -> KeyValueTags {
        self.config
            .default_tags
            .merge(tags)
            .ignore_config(&self.config.ignore_tags)
    }

    pub fn ignore(&self) -> &IgnoreConfig {
        &self.config.ignore_tags
    }
}

pub struct AwsBuilder {
    region: String,
    config: ProviderConfig,
    kafka: Option<Arc<dyn TagService>>,
    internet_monitor: Option<Arc<dyn InternetMonitorApi>>,
    ssm_contacts: Option<Arc<dyn SsmContactsApi>>,
    ssm_incidents: Option<Arc<dyn SsmIncidentsApi>>,
}

impl AwsBuilder {
    pub fn config(mut self, config: ProviderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn kafka(mut self, client: Arc<dyn TagService>) -> Self {
        self.kafka = Some(client);
        self
    }

    pub fn internet_monitor(mut self, client: Arc<dyn InternetMonitorApi>) -> Self {
        self.internet_monitor = Some(client);
        self
    }

    pub fn ssm_contacts(mut self, client: Arc<dyn SsmContactsApi>) -> Self {
        self.ssm_contacts = Some(client);
        self
    }

    pub fn ssm_incidents(mut self, client: Arc<dyn SsmIncidentsApi>) -> Self {
        self.ssm_incidents = Some(client);
        self
    }

    pub fn build(self) -> Result<Aws, ConfigError> {
        Ok(Aws {
            region: self.region,
            config: self.config,
            kafka: self.kafka.context(MissingClientSnafu { service: "kafka" })?,
            internet_monitor: self.internet_monitor.context(MissingClientSnafu {
                service: "internetmonitor",
            })?,
            ssm_contacts: self.ssm_contacts.context(MissingClientSnafu {
                service: "ssm-contacts",
            })?,
            ssm_incidents: self.ssm_incidents.context(MissingClientSnafu {
                service: "ssm-incidents",
            })?,
        })
    }
}

/// Every sweeper for the resources in this module.
pub fn sweepers() -> Sweepers<Arc<Aws>> {
    let mut sweepers = Sweepers::default();
    sweepers
        .add(internetmonitor::monitor_sweeper())
        .add(ssmcontacts::contact_sweeper())
        .add(ssmincidents::replication_set_sweeper());
    sweepers
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn provider_config_from_json() {
        let dir = std::env::temp_dir().join("skyform-provider-config");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("provider.json");
        std::fs::write(
            &path,
            r#"{
                "region": "eu-west-1",
                "default_tags": { "Env": "test", "Team": null },
                "ignore_tags": { "key_prefixes": ["kubernetes.io/"] }
            }"#,
        )
        .unwrap();
        let config = ProviderConfig::from_json_file(&path).unwrap();
        assert_eq!(Some("eu-west-1"), config.region.as_deref());
        assert_eq!(Some(Some("test")), config.default_tags.get("Env"));
        assert_eq!(Some(None), config.default_tags.get("Team"));
        assert!(config.ignore_tags.ignores("kubernetes.io/cluster"));
        assert!(config.ignore_tags.keys.is_empty());

        assert!(matches!(
            ProviderConfig::from_json_file(dir.join("missing.json")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn tags_all_layers_resource_tags_over_defaults() {
        let fake = Arc::new(fake::FakeCloud::default());
        let aws = fake.aws_with(ProviderConfig {
            region: None,
            default_tags: KeyValueTags::new().with("Env", "test").with("Name", "default"),
            ignore_tags: IgnoreConfig {
                keys: ["Owner".to_owned()].into_iter().collect(),
                key_prefixes: vec![],
            },
        });
        let tags = KeyValueTags::new().with("Name", "mine").with("Owner", "me");
        assert_eq!(
            KeyValueTags::new().with("Env", "test").with("Name", "mine"),
            aws.tags_all(&tags)
        );
    }

    #[test]
    fn builder_requires_every_client() {
        let fake = Arc::new(fake::FakeCloud::default());
        let err = Aws::builder("us-west-2")
            .kafka(fake.clone())
            .internet_monitor(fake.clone())
            .ssm_contacts(fake)
            .build()
            .unwrap_err();
        assert_eq!("No ssm-incidents client was configured", err.to_string());
    }

    #[tokio::test]
    async fn wait_for_status_rejects_unexpected_status() {
        let err = wait_for_status("Thing", "t-1", "ACTIVE", &["CREATING"], || async {
            Ok("FAILED".to_owned())
        })
        .await
        .unwrap_err();
        assert_eq!("Thing (t-1) reached unexpected status FAILED", err.to_string());
        assert_eq!(ErrorClass::Other, err.class());
    }

    #[test]
    fn unresolved_remotes_name_the_field() {
        let remote: crate::remote::Remote<String> = serde_json::from_value(serde_json::json!({
            "depends_on": "replication_set",
            "last_known_value": null
        }))
        .unwrap();
        let err = ResourceError::resolve("contact_id", &remote).unwrap_err();
        assert!(
            matches!(&err, ResourceError::Unresolved { field: "contact_id", .. }),
            "{err:?}"
        );
        assert!(err.to_string().starts_with("Could not resolve 'contact_id'"));
        assert_eq!(ErrorClass::Other, err.class());
    }
}
