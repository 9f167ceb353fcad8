use snafu::prelude::*;

use crate::{
    aws::{ApiSnafu, Aws, ResourceError},
    remote::Remote,
    HasDependencies, Resource,
};

use super::{ActivationStatus, ChannelType, DeliveryAddress};

/// A way to engage a contact: an email address, or a phone number to text or
/// call.
///
/// Channels are created with activation deferred, so they stay
/// `NOT_ACTIVATED` until the contact enters the code they are sent.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
pub struct ContactChannel {
    /// ARN of the contact the channel belongs to.
    pub contact_id: Remote<String>,
    pub name: String,
    pub r#type: ChannelType,
    pub delivery_address: DeliveryAddress,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ContactChannelOutput {
    pub arn: String,
    pub contact_id: String,
    pub name: String,
    pub r#type: ChannelType,
    pub delivery_address: DeliveryAddress,
    pub activation_status: ActivationStatus,
}

impl Resource for ContactChannel {
    type Provider = Aws;
    type Error = ResourceError;
    type Output = ContactChannelOutput;

    async fn create(&self, aws: &Aws) -> Result<ContactChannelOutput, ResourceError> {
        let contact_id = ResourceError::resolve("contact_id", &self.contact_id)?;
        let arn = aws
            .ssm_contacts()
            .create_contact_channel(&contact_id, &self.name, self.r#type, &self.delivery_address)
            .await
            .context(ApiSnafu {
                verb: "creating",
                kind: Self::kind(),
                identifier: &self.name,
            })?;
        log::info!("  created {arn}");
        Self::read(aws, &arn).await
    }

    async fn read(aws: &Aws, identifier: &str) -> Result<ContactChannelOutput, ResourceError> {
        aws.ssm_contacts()
            .get_contact_channel(identifier)
            .await
            .context(ApiSnafu {
                verb: "reading",
                kind: Self::kind(),
                identifier,
            })
    }

    async fn update(
        &self,
        aws: &Aws,
        _previous_local: &Self,
        previous_remote: &ContactChannelOutput,
    ) -> Result<ContactChannelOutput, ResourceError> {
        let arn = previous_remote.arn.as_str();
        aws.ssm_contacts()
            .update_contact_channel(arn, &self.name, &self.delivery_address)
            .await
            .context(ApiSnafu {
                verb: "updating",
                kind: Self::kind(),
                identifier: arn,
            })?;
        Self::read(aws, arn).await
    }

    async fn delete(aws: &Aws, identifier: &str) -> Result<(), ResourceError> {
        aws.ssm_contacts()
            .delete_contact_channel(identifier)
            .await
            .context(ApiSnafu {
                verb: "deleting",
                kind: Self::kind(),
                identifier,
            })
    }

    fn identifier(output: &ContactChannelOutput) -> String {
        output.arn.clone()
    }

    /// The type of a channel and the contact it belongs to can't be changed.
    fn requires_replacement(&self, previous: &Self) -> bool {
        self.r#type != previous.r#type || self.contact_id != previous.contact_id
    }

    fn drifted(&self, remote: &ContactChannelOutput) -> bool {
        self.name != remote.name || self.delivery_address != remote.delivery_address
    }

    fn kind() -> &'static str {
        "SSM Contacts Contact Channel"
    }
}
