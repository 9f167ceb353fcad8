//! Amazon CloudWatch Internet Monitor.
//!
//! A monitor is addressed by its name. It can only be deleted once it is
//! `INACTIVE`, so deletion first deactivates it and waits.
use std::collections::{BTreeSet, HashMap};

use aws_sdk_internetmonitor::types::MonitorConfigState;
use snafu::prelude::*;

use crate::{
    api::{ApiError, ApiFuture},
    aws::{wait_for_status, ApiSnafu, Aws, ResourceError, TagsSnafu},
    sweep::Page,
    tags::{update_tags, KeyValueTags, TagService},
    HasDependencies, Resource,
};

mod sweep;
#[cfg(test)]
mod test;

pub use sweep::{monitor_sweeper, MONITOR_SWEEPER};

/// Status of a monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MonitorStatus {
    Pending,
    Active,
    Inactive,
    Error,
}

impl MonitorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorStatus::Pending => "PENDING",
            MonitorStatus::Active => "ACTIVE",
            MonitorStatus::Inactive => "INACTIVE",
            MonitorStatus::Error => "ERROR",
        }
    }
}

impl From<&str> for MonitorStatus {
    fn from(value: &str) -> Self {
        match value {
            "PENDING" => MonitorStatus::Pending,
            "ACTIVE" => MonitorStatus::Active,
            "INACTIVE" => MonitorStatus::Inactive,
            _ => MonitorStatus::Error,
        }
    }
}

/// A monitor as listed.
#[derive(Clone, Debug, PartialEq)]
pub struct MonitorSummary {
    pub name: String,
    pub arn: String,
    pub status: MonitorStatus,
}

/// Changes to apply to a monitor in one `UpdateMonitor` call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MonitorUpdate {
    pub resources_to_add: Vec<String>,
    pub resources_to_remove: Vec<String>,
    pub status: Option<MonitorStatus>,
    pub max_city_networks_to_monitor: Option<i32>,
    pub traffic_percentage_to_monitor: Option<i32>,
}

/// The Internet Monitor calls used by this crate.
pub trait InternetMonitorApi: TagService {
    fn list_monitors<'a>(&'a self, next_token: Option<String>)
        -> ApiFuture<'a, Page<MonitorSummary>>;

    /// Creates the monitor, returning its ARN.
    fn create_monitor<'a>(
        &'a self,
        monitor: &'a Monitor,
        tags: &'a KeyValueTags,
    ) -> ApiFuture<'a, String>;

    fn get_monitor<'a>(&'a self, name: &'a str) -> ApiFuture<'a, MonitorOutput>;

    fn update_monitor<'a>(&'a self, name: &'a str, update: &'a MonitorUpdate)
        -> ApiFuture<'a, ()>;

    fn delete_monitor<'a>(&'a self, name: &'a str) -> ApiFuture<'a, ()>;
}

/// An Internet Monitor monitor.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
pub struct Monitor {
    pub monitor_name: String,
    /// ARNs of the VPCs, NLBs, CloudFront distributions or WorkSpaces
    /// directories to monitor.
    #[serde(default)]
    pub resources: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_city_networks_to_monitor: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_percentage_to_monitor: Option<i32>,
    #[serde(default)]
    pub tags: KeyValueTags,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MonitorOutput {
    pub arn: String,
    pub monitor_name: String,
    pub resources: BTreeSet<String>,
    pub status: MonitorStatus,
    pub max_city_networks_to_monitor: Option<i32>,
    pub traffic_percentage_to_monitor: Option<i32>,
    /// Every tag on the monitor, defaults included.
    pub tags: KeyValueTags,
}

async fn wait_for_active(api: &dyn InternetMonitorApi, name: &str) -> Result<(), ResourceError> {
    wait_for_status(
        Monitor::kind(),
        name,
        MonitorStatus::Active.as_str(),
        &[MonitorStatus::Pending.as_str()],
        move || async move {
            let output = api.get_monitor(name).await.context(ApiSnafu {
                verb: "reading",
                kind: Monitor::kind(),
                identifier: name,
            })?;
            Ok(output.status.as_str().to_owned())
        },
    )
    .await
}

impl Resource for Monitor {
    type Provider = Aws;
    type Error = ResourceError;
    type Output = MonitorOutput;

    async fn create(&self, aws: &Aws) -> Result<MonitorOutput, ResourceError> {
        let api = aws.internet_monitor();
        let tags = aws.tags_all(&self.tags);
        let arn = api
            .create_monitor(self, &tags)
            .await
            .context(ApiSnafu {
                verb: "creating",
                kind: Self::kind(),
                identifier: &self.monitor_name,
            })?;
        log::info!("  created {arn}");
        wait_for_active(api, &self.monitor_name).await?;
        Self::read(aws, &self.monitor_name).await
    }

    async fn read(aws: &Aws, identifier: &str) -> Result<MonitorOutput, ResourceError> {
        let api = aws.internet_monitor();
        let mut output = api.get_monitor(identifier).await.context(ApiSnafu {
            verb: "reading",
            kind: Self::kind(),
            identifier,
        })?;
        output.tags = output
            .tags
            .ignore_system(&api.tag_policy())
            .ignore_config(aws.ignore());
        Ok(output)
    }

    async fn update(
        &self,
        aws: &Aws,
        _previous_local: &Self,
        previous_remote: &MonitorOutput,
    ) -> Result<MonitorOutput, ResourceError> {
        let api = aws.internet_monitor();
        let name = previous_remote.monitor_name.as_str();
        let update = MonitorUpdate {
            resources_to_add: self
                .resources
                .difference(&previous_remote.resources)
                .cloned()
                .collect(),
            resources_to_remove: previous_remote
                .resources
                .difference(&self.resources)
                .cloned()
                .collect(),
            status: None,
            max_city_networks_to_monitor: self
                .max_city_networks_to_monitor
                .filter(|n| Some(*n) != previous_remote.max_city_networks_to_monitor),
            traffic_percentage_to_monitor: self
                .traffic_percentage_to_monitor
                .filter(|p| Some(*p) != previous_remote.traffic_percentage_to_monitor),
        };
        if update != MonitorUpdate::default() {
            api.update_monitor(name, &update).await.context(ApiSnafu {
                verb: "updating",
                kind: Self::kind(),
                identifier: name,
            })?;
            wait_for_active(api, name).await?;
        }
        update_tags(
            api,
            &previous_remote.arn,
            &previous_remote.tags,
            &aws.tags_all(&self.tags),
        )
        .await
        .context(TagsSnafu {
            kind: Self::kind(),
            identifier: name,
        })?;
        Self::read(aws, name).await
    }

    async fn delete(aws: &Aws, identifier: &str) -> Result<(), ResourceError> {
        let api = aws.internet_monitor();
        let deactivate = MonitorUpdate {
            status: Some(MonitorStatus::Inactive),
            ..Default::default()
        };
        api.update_monitor(identifier, &deactivate)
            .await
            .context(ApiSnafu {
                verb: "deactivating",
                kind: Self::kind(),
                identifier,
            })?;
        wait_for_status(
            Self::kind(),
            identifier,
            MonitorStatus::Inactive.as_str(),
            &[
                MonitorStatus::Pending.as_str(),
                MonitorStatus::Active.as_str(),
            ],
            move || async move {
                let output = api.get_monitor(identifier).await.context(ApiSnafu {
                    verb: "reading",
                    kind: Self::kind(),
                    identifier,
                })?;
                Ok(output.status.as_str().to_owned())
            },
        )
        .await?;
        api.delete_monitor(identifier).await.context(ApiSnafu {
            verb: "deleting",
            kind: Self::kind(),
            identifier,
        })
    }

    fn identifier(output: &MonitorOutput) -> String {
        output.monitor_name.clone()
    }

    fn requires_replacement(&self, previous: &Self) -> bool {
        self.monitor_name != previous.monitor_name
    }

    fn drifted(&self, remote: &MonitorOutput) -> bool {
        self.resources != remote.resources
            || (self.traffic_percentage_to_monitor.is_some()
                && self.traffic_percentage_to_monitor != remote.traffic_percentage_to_monitor)
    }

    fn kind() -> &'static str {
        "Internet Monitor Monitor"
    }
}

fn sdk_tags(tags: &KeyValueTags) -> HashMap<String, String> {
    tags.map().into_iter().collect()
}

impl TagService for aws_sdk_internetmonitor::Client {
    fn list_tags<'a>(&'a self, identifier: &'a str) -> ApiFuture<'a, KeyValueTags> {
        Box::pin(async move {
            let out = self
                .list_tags_for_resource()
                .resource_arn(identifier)
                .send()
                .await
                .map_err(ApiError::from)?;
            Ok(out.tags.unwrap_or_default().into_iter().collect())
        })
    }

    fn tag_resource<'a>(
        &'a self,
        identifier: &'a str,
        tags: &'a KeyValueTags,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            self.tag_resource()
                .resource_arn(identifier)
                .set_tags(Some(sdk_tags(tags)))
                .send()
                .await
                .map_err(ApiError::from)?;
            Ok(())
        })
    }

    fn untag_resource<'a>(&'a self, identifier: &'a str, keys: &'a [String]) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            self.untag_resource()
                .resource_arn(identifier)
                .set_tag_keys(Some(keys.to_vec()))
                .send()
                .await
                .map_err(ApiError::from)?;
            Ok(())
        })
    }
}

impl InternetMonitorApi for aws_sdk_internetmonitor::Client {
    fn list_monitors<'a>(
        &'a self,
        next_token: Option<String>,
    ) -> ApiFuture<'a, Page<MonitorSummary>> {
        Box::pin(async move {
            let out = self
                .list_monitors()
                .set_next_token(next_token)
                .send()
                .await
                .map_err(ApiError::from)?;
            let items = out
                .monitors
                .into_iter()
                .map(|monitor| MonitorSummary {
                    status: MonitorStatus::from(monitor.status.as_str()),
                    name: monitor.monitor_name,
                    arn: monitor.monitor_arn,
                })
                .collect();
            Ok(Page {
                items,
                next_token: out.next_token,
            })
        })
    }

    fn create_monitor<'a>(
        &'a self,
        monitor: &'a Monitor,
        tags: &'a KeyValueTags,
    ) -> ApiFuture<'a, String> {
        Box::pin(async move {
            let out = self
                .create_monitor()
                .monitor_name(&monitor.monitor_name)
                .set_resources(Some(monitor.resources.iter().cloned().collect()))
                .set_max_city_networks_to_monitor(monitor.max_city_networks_to_monitor)
                .set_traffic_percentage_to_monitor(monitor.traffic_percentage_to_monitor)
                .set_tags((!tags.is_empty()).then(|| sdk_tags(tags)))
                .send()
                .await
                .map_err(ApiError::from)?;
            Ok(out.arn)
        })
    }

    fn get_monitor<'a>(&'a self, name: &'a str) -> ApiFuture<'a, MonitorOutput> {
        Box::pin(async move {
            let out = self
                .get_monitor()
                .monitor_name(name)
                .send()
                .await
                .map_err(ApiError::from)?;
            Ok(MonitorOutput {
                arn: out.monitor_arn,
                monitor_name: out.monitor_name,
                resources: out.resources.into_iter().collect(),
                status: MonitorStatus::from(out.status.as_str()),
                max_city_networks_to_monitor: out.max_city_networks_to_monitor,
                traffic_percentage_to_monitor: out.traffic_percentage_to_monitor,
                tags: out.tags.unwrap_or_default().into_iter().collect(),
            })
        })
    }

    fn update_monitor<'a>(
        &'a self,
        name: &'a str,
        update: &'a MonitorUpdate,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            self.update_monitor()
                .monitor_name(name)
                .set_resources_to_add(
                    (!update.resources_to_add.is_empty()).then(|| update.resources_to_add.clone()),
                )
                .set_resources_to_remove(
                    (!update.resources_to_remove.is_empty())
                        .then(|| update.resources_to_remove.clone()),
                )
                .set_status(
                    update
                        .status
                        .map(|status| MonitorConfigState::from(status.as_str())),
                )
                .set_max_city_networks_to_monitor(update.max_city_networks_to_monitor)
                .set_traffic_percentage_to_monitor(update.traffic_percentage_to_monitor)
                .send()
                .await
                .map_err(ApiError::from)?;
            Ok(())
        })
    }

    fn delete_monitor<'a>(&'a self, name: &'a str) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            self.delete_monitor()
                .monitor_name(name)
                .send()
                .await
                .map_err(ApiError::from)?;
            Ok(())
        })
    }
}
