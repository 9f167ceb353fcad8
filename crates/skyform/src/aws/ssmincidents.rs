//! AWS Systems Manager Incident Manager.
//!
//! The replication set is the account's Incident Manager configuration and
//! must exist before any SSM Contacts contact can be created. Deleting it
//! deletes every contact with it.
use std::{collections::HashMap, sync::Arc};

use aws_sdk_ssmincidents::types::RegionMapInputValue;
use snafu::prelude::*;

use crate::{
    api::{ApiError, ApiFuture, BoxFuture, Classify},
    aws::{
        ssmcontacts::CONTACT_SWEEPER, wait_for_status, ApiSnafu, Aws, ResourceError, TagsSnafu,
    },
    sweep::{
        sweep_candidates, sweep_pages, Page, SweepConfig, SweepError, SweepReport, SweepResource,
        Sweepable, Sweeper,
    },
    tags::{list_tags, update_tags, KeyValueTags, TagService},
    HasDependencies, Resource,
};

pub const REPLICATION_SET_SWEEPER: &str = "aws_ssmincidents_replication_set";

const ACTIVE: &str = "ACTIVE";
const CREATING: &str = "CREATING";
const DELETING: &str = "DELETING";
/// Not a service status, stands for "the set no longer exists".
const DELETED: &str = "DELETED";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ReplicationRegion {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms_key_arn: Option<String>,
}

impl HasDependencies for ReplicationRegion {}

impl ReplicationRegion {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kms_key_arn: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RegionOutput {
    pub name: String,
    pub kms_key_arn: Option<String>,
    pub status: String,
}

/// The Incident Manager calls used by this crate.
pub trait SsmIncidentsApi: TagService {
    /// Creates the replication set, returning its ARN.
    fn create_replication_set<'a>(
        &'a self,
        regions: &'a [ReplicationRegion],
        tags: &'a KeyValueTags,
    ) -> ApiFuture<'a, String>;

    /// Reads the replication set. The output's `tags` are left empty, they
    /// are listed with [`TagService::list_tags`].
    fn get_replication_set<'a>(&'a self, arn: &'a str) -> ApiFuture<'a, ReplicationSetOutput>;

    fn delete_replication_set<'a>(&'a self, arn: &'a str) -> ApiFuture<'a, ()>;

    fn list_replication_sets<'a>(&'a self, next_token: Option<String>)
        -> ApiFuture<'a, Page<String>>;
}

/// An Incident Manager replication set.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
pub struct ReplicationSet {
    pub regions: Vec<ReplicationRegion>,
    #[serde(default)]
    pub tags: KeyValueTags,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReplicationSetOutput {
    pub arn: String,
    /// Sorted by region name.
    pub regions: Vec<RegionOutput>,
    pub status: String,
    pub deletion_protected: bool,
    pub tags: KeyValueTags,
}

impl ReplicationSet {
    fn sorted_regions(&self) -> Vec<ReplicationRegion> {
        let mut regions = self.regions.clone();
        regions.sort();
        regions
    }
}

async fn status(api: &dyn SsmIncidentsApi, arn: &str) -> Result<String, ResourceError> {
    match api.get_replication_set(arn).await {
        Ok(output) => Ok(output.status),
        Err(error) if error.proves_absence() => Ok(DELETED.to_owned()),
        Err(source) => Err(ResourceError::Api {
            verb: "reading",
            kind: ReplicationSet::kind(),
            identifier: arn.to_owned(),
            source,
        }),
    }
}

impl Resource for ReplicationSet {
    type Provider = Aws;
    type Error = ResourceError;
    type Output = ReplicationSetOutput;

    async fn create(&self, aws: &Aws) -> Result<ReplicationSetOutput, ResourceError> {
        let api = aws.ssm_incidents();
        let regions = self.sorted_regions();
        let tags = aws.tags_all(&self.tags);
        let arn = api
            .create_replication_set(&regions, &tags)
            .await
            .context(ApiSnafu {
                verb: "creating",
                kind: Self::kind(),
                identifier: aws.region(),
            })?;
        log::info!("  created {arn}");
        wait_for_status(Self::kind(), &arn, ACTIVE, &[CREATING], || status(api, &arn)).await?;
        Self::read(aws, &arn).await
    }

    async fn read(aws: &Aws, identifier: &str) -> Result<ReplicationSetOutput, ResourceError> {
        let api = aws.ssm_incidents();
        let mut output = api
            .get_replication_set(identifier)
            .await
            .context(ApiSnafu {
                verb: "reading",
                kind: Self::kind(),
                identifier,
            })?;
        output.tags = list_tags(api, identifier, aws.ignore())
            .await
            .context(TagsSnafu {
                kind: Self::kind(),
                identifier,
            })?;
        Ok(output)
    }

    async fn update(
        &self,
        aws: &Aws,
        _previous_local: &Self,
        previous_remote: &ReplicationSetOutput,
    ) -> Result<ReplicationSetOutput, ResourceError> {
        let api = aws.ssm_incidents();
        update_tags(
            api,
            &previous_remote.arn,
            &previous_remote.tags,
            &aws.tags_all(&self.tags),
        )
        .await
        .context(TagsSnafu {
            kind: Self::kind(),
            identifier: &previous_remote.arn,
        })?;
        Self::read(aws, &previous_remote.arn).await
    }

    async fn delete(aws: &Aws, identifier: &str) -> Result<(), ResourceError> {
        let api = aws.ssm_incidents();
        api.delete_replication_set(identifier)
            .await
            .context(ApiSnafu {
                verb: "deleting",
                kind: Self::kind(),
                identifier,
            })?;
        wait_for_status(Self::kind(), identifier, DELETED, &[DELETING, ACTIVE], || {
            status(api, identifier)
        })
        .await
    }

    fn identifier(output: &ReplicationSetOutput) -> String {
        output.arn.clone()
    }

    fn requires_replacement(&self, previous: &Self) -> bool {
        self.sorted_regions() != previous.sorted_regions()
    }

    fn drifted(&self, remote: &ReplicationSetOutput) -> bool {
        let local = self.sorted_regions();
        local.len() != remote.regions.len()
            || local
                .iter()
                .zip(remote.regions.iter())
                .any(|(l, r)| l.name != r.name || l.kms_key_arn != r.kms_key_arn)
    }

    fn kind() -> &'static str {
        "SSM Incidents Replication Set"
    }
}

pub fn replication_set_sweeper() -> Sweeper<Arc<Aws>> {
    Sweeper {
        name: REPLICATION_SET_SWEEPER,
        dependencies: &[CONTACT_SWEEPER],
        run: sweep_replication_sets,
    }
}

/// Replication sets have no name, so every set in the region is swept
/// regardless of the name prefix.
fn sweep_replication_sets<'a>(
    aws: &'a Arc<Aws>,
    region: &'a str,
    config: &'a SweepConfig,
) -> BoxFuture<'a, Result<SweepReport, SweepError>> {
    Box::pin(async move {
        let api = aws.ssm_incidents();
        let Some(arns) = sweep_pages(ReplicationSet::kind(), region, |token| {
            api.list_replication_sets(token)
        })
        .await?
        else {
            return Ok(SweepReport::skipped(REPLICATION_SET_SWEEPER, region));
        };
        let candidates = arns
            .into_iter()
            .map(|arn| {
                Arc::new(SweepResource::<ReplicationSet>::new(arn, aws.clone())) as Arc<dyn Sweepable>
            })
            .collect();
        sweep_candidates(REPLICATION_SET_SWEEPER, region, config, candidates).await
    })
}

impl TagService for aws_sdk_ssmincidents::Client {
    fn list_tags<'a>(&'a self, identifier: &'a str) -> ApiFuture<'a, KeyValueTags> {
        Box::pin(async move {
            let out = self
                .list_tags_for_resource()
                .resource_arn(identifier)
                .send()
                .await
                .map_err(ApiError::from)?;
            Ok(out.tags.into_iter().collect())
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
                .set_tags(Some(tags.map().into_iter().collect()))
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

impl SsmIncidentsApi for aws_sdk_ssmincidents::Client {
    fn create_replication_set<'a>(
        &'a self,
        regions: &'a [ReplicationRegion],
        tags: &'a KeyValueTags,
    ) -> ApiFuture<'a, String> {
        Box::pin(async move {
            let regions: HashMap<String, RegionMapInputValue> = regions
                .iter()
                .map(|region| {
                    (
                        region.name.clone(),
                        RegionMapInputValue::builder()
                            .set_sse_kms_key_id(region.kms_key_arn.clone())
                            .build(),
                    )
                })
                .collect();
            let out = self
                .create_replication_set()
                .set_regions(Some(regions))
                .set_tags((!tags.is_empty()).then(|| tags.map().into_iter().collect()))
                .send()
                .await
                .map_err(ApiError::from)?;
            Ok(out.arn)
        })
    }

    fn get_replication_set<'a>(&'a self, arn: &'a str) -> ApiFuture<'a, ReplicationSetOutput> {
        Box::pin(async move {
            let out = self
                .get_replication_set()
                .arn(arn)
                .send()
                .await
                .map_err(ApiError::from)?;
            let set = out
                .replication_set
                .ok_or_else(|| ApiError::not_found(format!("replication set {arn}")))?;
            let mut regions: Vec<RegionOutput> = set
                .region_map
                .into_iter()
                .map(|(name, info)| RegionOutput {
                    name,
                    kms_key_arn: info.sse_kms_key_id,
                    status: info.status.as_str().to_owned(),
                })
                .collect();
            regions.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(ReplicationSetOutput {
                arn: set.arn.unwrap_or_else(|| arn.to_owned()),
                regions,
                status: set.status.as_str().to_owned(),
                deletion_protected: set.deletion_protected,
                tags: KeyValueTags::new(),
            })
        })
    }

    fn delete_replication_set<'a>(&'a self, arn: &'a str) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            self.delete_replication_set()
                .arn(arn)
                .send()
                .await
                .map_err(ApiError::from)?;
            Ok(())
        })
    }

    fn list_replication_sets<'a>(
        &'a self,
        next_token: Option<String>,
    ) -> ApiFuture<'a, Page<String>> {
        Box::pin(async move {
            let out = self
                .list_replication_sets()
                .set_next_token(next_token)
                .send()
                .await
                .map_err(ApiError::from)?;
            Ok(Page {
                items: out.replication_set_arns,
                next_token: out.next_token,
            })
        })
    }
}
