use snafu::prelude::*;

use crate::{
    aws::{ApiSnafu, Aws, ResourceError, TagsSnafu},
    remote::Remote,
    tags::{list_tags, update_tags, KeyValueTags},
    HasDependencies, Resource,
};

use super::ContactType;

/// An SSM Contacts contact: a person, an escalation plan or an on-call
/// schedule that incidents engage.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
pub struct Contact {
    /// Unique, used to find the contact in the console.
    pub alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub r#type: ContactType,
    #[serde(default)]
    pub tags: KeyValueTags,
    /// Values of resources that must be applied first, usually the ARN of
    /// the replication set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<Remote<String>>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ContactOutput {
    pub arn: String,
    pub alias: String,
    pub display_name: Option<String>,
    pub r#type: ContactType,
    pub tags: KeyValueTags,
}

impl Resource for Contact {
    type Provider = Aws;
    type Error = ResourceError;
    type Output = ContactOutput;

    async fn create(&self, aws: &Aws) -> Result<ContactOutput, ResourceError> {
        let api = aws.ssm_contacts();
        let tags = aws.tags_all(&self.tags);
        let arn = api
            .create_contact(
                &self.alias,
                self.display_name.as_deref(),
                self.r#type,
                &tags,
            )
            .await
            .context(ApiSnafu {
                verb: "creating",
                kind: Self::kind(),
                identifier: &self.alias,
            })?;
        log::info!("  created {arn}");
        Self::read(aws, &arn).await
    }

    async fn read(aws: &Aws, identifier: &str) -> Result<ContactOutput, ResourceError> {
        let api = aws.ssm_contacts();
        let contact = api.get_contact(identifier).await.context(ApiSnafu {
            verb: "reading",
            kind: Self::kind(),
            identifier,
        })?;
        let tags = list_tags(api, identifier, aws.ignore())
            .await
            .context(TagsSnafu {
                kind: Self::kind(),
                identifier,
            })?;
        Ok(ContactOutput {
            arn: contact.arn,
            alias: contact.alias,
            display_name: contact.display_name,
            r#type: contact.r#type,
            tags,
        })
    }

    async fn update(
        &self,
        aws: &Aws,
        _previous_local: &Self,
        previous_remote: &ContactOutput,
    ) -> Result<ContactOutput, ResourceError> {
        let api = aws.ssm_contacts();
        let arn = previous_remote.arn.as_str();
        if self.display_name != previous_remote.display_name {
            api.update_contact(arn, self.display_name.as_deref())
                .await
                .context(ApiSnafu {
                    verb: "updating",
                    kind: Self::kind(),
                    identifier: arn,
                })?;
        }
        update_tags(api, arn, &previous_remote.tags, &aws.tags_all(&self.tags))
            .await
            .context(TagsSnafu {
                kind: Self::kind(),
                identifier: arn,
            })?;
        Self::read(aws, arn).await
    }

    async fn delete(aws: &Aws, identifier: &str) -> Result<(), ResourceError> {
        aws.ssm_contacts()
            .delete_contact(identifier)
            .await
            .context(ApiSnafu {
                verb: "deleting",
                kind: Self::kind(),
                identifier,
            })
    }

    fn identifier(output: &ContactOutput) -> String {
        output.arn.clone()
    }

    fn requires_replacement(&self, previous: &Self) -> bool {
        self.alias != previous.alias || self.r#type != previous.r#type
    }

    fn drifted(&self, remote: &ContactOutput) -> bool {
        self.display_name != remote.display_name
    }

    fn kind() -> &'static str {
        "SSM Contacts Contact"
    }
}
