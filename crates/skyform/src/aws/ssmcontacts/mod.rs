//! AWS Systems Manager Incident Manager Contacts.
//!
//! Contacts need an Incident Manager replication set in the account (see
//! [`ssmincidents`](crate::aws::ssmincidents)). Contact channels belong to a
//! contact and are deleted with it.
use std::sync::Arc;

use aws_sdk_ssmcontacts::types as sdk;

use crate::{
    api::{ApiError, ApiFuture, BoxFuture},
    aws::Aws,
    sweep::{
        sweep_candidates, sweep_pages, Page, SweepConfig, SweepError, SweepReport, SweepResource,
        Sweepable, Sweeper,
    },
    tags::{KeyValueTags, TagService},
    HasDependencies, Resource,
};

mod channel;
mod contact;

pub use channel::{ContactChannel, ContactChannelOutput};
pub use contact::{Contact, ContactOutput};

pub const CONTACT_SWEEPER: &str = "aws_ssmcontacts_contact";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContactType {
    #[default]
    Personal,
    Escalation,
    OncallSchedule,
}

impl HasDependencies for ContactType {}

impl ContactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactType::Personal => "PERSONAL",
            ContactType::Escalation => "ESCALATION",
            ContactType::OncallSchedule => "ONCALL_SCHEDULE",
        }
    }
}

impl From<&str> for ContactType {
    fn from(value: &str) -> Self {
        match value {
            "ESCALATION" => ContactType::Escalation,
            "ONCALL_SCHEDULE" => ContactType::OncallSchedule,
            _ => ContactType::Personal,
        }
    }
}

/// How a contact channel reaches the contact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelType {
    Email,
    Sms,
    Voice,
}

impl HasDependencies for ChannelType {}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Email => "EMAIL",
            ChannelType::Sms => "SMS",
            ChannelType::Voice => "VOICE",
        }
    }
}

impl From<&str> for ChannelType {
    fn from(value: &str) -> Self {
        match value {
            "SMS" => ChannelType::Sms,
            "VOICE" => ChannelType::Voice,
            _ => ChannelType::Email,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivationStatus {
    Activated,
    NotActivated,
}

/// An email address or phone number, depending on the channel type.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeliveryAddress {
    pub simple_address: String,
}

impl HasDependencies for DeliveryAddress {}

impl DeliveryAddress {
    pub fn new(simple_address: impl Into<String>) -> Self {
        Self {
            simple_address: simple_address.into(),
        }
    }
}

/// A contact as returned by `GetContact` and `ListContacts`.
#[derive(Clone, Debug, PartialEq)]
pub struct ContactSummary {
    pub arn: String,
    pub alias: String,
    pub display_name: Option<String>,
    pub r#type: ContactType,
}

/// The SSM Contacts calls used by this crate.
pub trait SsmContactsApi: TagService {
    /// Creates the contact with an empty engagement plan, returning its ARN.
    fn create_contact<'a>(
        &'a self,
        alias: &'a str,
        display_name: Option<&'a str>,
        r#type: ContactType,
        tags: &'a KeyValueTags,
    ) -> ApiFuture<'a, String>;

    fn get_contact<'a>(&'a self, arn: &'a str) -> ApiFuture<'a, ContactSummary>;

    fn update_contact<'a>(
        &'a self,
        arn: &'a str,
        display_name: Option<&'a str>,
    ) -> ApiFuture<'a, ()>;

    fn delete_contact<'a>(&'a self, arn: &'a str) -> ApiFuture<'a, ()>;

    fn list_contacts<'a>(&'a self, next_token: Option<String>)
        -> ApiFuture<'a, Page<ContactSummary>>;

    /// Creates the channel without sending an activation code, returning its
    /// ARN.
    fn create_contact_channel<'a>(
        &'a self,
        contact_id: &'a str,
        name: &'a str,
        r#type: ChannelType,
        delivery_address: &'a DeliveryAddress,
    ) -> ApiFuture<'a, String>;

    fn get_contact_channel<'a>(&'a self, arn: &'a str) -> ApiFuture<'a, ContactChannelOutput>;

    fn update_contact_channel<'a>(
        &'a self,
        arn: &'a str,
        name: &'a str,
        delivery_address: &'a DeliveryAddress,
    ) -> ApiFuture<'a, ()>;

    fn delete_contact_channel<'a>(&'a self, arn: &'a str) -> ApiFuture<'a, ()>;
}

pub fn contact_sweeper() -> Sweeper<Arc<Aws>> {
    Sweeper {
        name: CONTACT_SWEEPER,
        dependencies: &[],
        run: sweep_contacts,
    }
}

fn sweep_contacts<'a>(
    aws: &'a Arc<Aws>,
    region: &'a str,
    config: &'a SweepConfig,
) -> BoxFuture<'a, Result<SweepReport, SweepError>> {
    Box::pin(async move {
        let api = aws.ssm_contacts();
        let Some(contacts) =
            sweep_pages(Contact::kind(), region, |token| api.list_contacts(token)).await?
        else {
            return Ok(SweepReport::skipped(CONTACT_SWEEPER, region));
        };
        let candidates = contacts
            .into_iter()
            .filter(|contact| config.matches(&contact.alias))
            .map(|contact| {
                Arc::new(SweepResource::<Contact>::new(contact.arn, aws.clone())) as Arc<dyn Sweepable>
            })
            .collect();
        sweep_candidates(CONTACT_SWEEPER, region, config, candidates).await
    })
}

/// Tags as SSM Contacts takes them. A tag without a value is sent without one.
fn sdk_tags(tags: &KeyValueTags) -> Vec<sdk::Tag> {
    tags.iter()
        .map(|(key, value)| {
            sdk::Tag::builder()
                .key(key)
                .set_value(value.map(str::to_owned))
                .build()
        })
        .collect()
}

fn key_value_tags(tags: Vec<sdk::Tag>) -> KeyValueTags {
    KeyValueTags::from_optional(
        tags.into_iter()
            .filter_map(|tag| Some((tag.key?, tag.value))),
    )
}

fn sdk_address(address: &DeliveryAddress) -> sdk::ContactChannelAddress {
    sdk::ContactChannelAddress::builder()
        .simple_address(&address.simple_address)
        .build()
}

fn delivery_address(address: Option<sdk::ContactChannelAddress>) -> DeliveryAddress {
    DeliveryAddress {
        simple_address: address
            .and_then(|address| address.simple_address)
            .unwrap_or_default(),
    }
}

impl TagService for aws_sdk_ssmcontacts::Client {
    fn list_tags<'a>(&'a self, identifier: &'a str) -> ApiFuture<'a, KeyValueTags> {
        Box::pin(async move {
            let out = self
                .list_tags_for_resource()
                .resource_arn(identifier)
                .send()
                .await
                .map_err(ApiError::from)?;
            Ok(key_value_tags(out.tags.unwrap_or_default()))
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

impl SsmContactsApi for aws_sdk_ssmcontacts::Client {
    fn create_contact<'a>(
        &'a self,
        alias: &'a str,
        display_name: Option<&'a str>,
        r#type: ContactType,
        tags: &'a KeyValueTags,
    ) -> ApiFuture<'a, String> {
        Box::pin(async move {
            let out = self
                .create_contact()
                .alias(alias)
                .set_display_name(display_name.map(str::to_owned))
                .r#type(sdk::ContactType::from(r#type.as_str()))
                .plan(sdk::Plan::builder().set_stages(Some(vec![])).build())
                .set_tags((!tags.is_empty()).then(|| sdk_tags(tags)))
                .send()
                .await
                .map_err(ApiError::from)?;
            Ok(out.contact_arn)
        })
    }

    fn get_contact<'a>(&'a self, arn: &'a str) -> ApiFuture<'a, ContactSummary> {
        Box::pin(async move {
            let out = self
                .get_contact()
                .contact_id(arn)
                .send()
                .await
                .map_err(ApiError::from)?;
            Ok(ContactSummary {
                arn: out.contact_arn,
                alias: out.alias,
                display_name: out.display_name,
                r#type: ContactType::from(out.r#type.as_str()),
            })
        })
    }

    fn update_contact<'a>(
        &'a self,
        arn: &'a str,
        display_name: Option<&'a str>,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            self.update_contact()
                .contact_id(arn)
                .set_display_name(display_name.map(str::to_owned))
                .send()
                .await
                .map_err(ApiError::from)?;
            Ok(())
        })
    }

    fn delete_contact<'a>(&'a self, arn: &'a str) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            self.delete_contact()
                .contact_id(arn)
                .send()
                .await
                .map_err(ApiError::from)?;
            Ok(())
        })
    }

    fn list_contacts<'a>(
        &'a self,
        next_token: Option<String>,
    ) -> ApiFuture<'a, Page<ContactSummary>> {
        Box::pin(async move {
            let out = self
                .list_contacts()
                .set_next_token(next_token)
                .send()
                .await
                .map_err(ApiError::from)?;
            let items = out
                .contacts
                .unwrap_or_default()
                .into_iter()
                .map(|contact| ContactSummary {
                    r#type: ContactType::from(contact.r#type.as_str()),
                    arn: contact.contact_arn,
                    alias: contact.alias,
                    display_name: contact.display_name,
                })
                .collect();
            Ok(Page {
                items,
                next_token: out.next_token,
            })
        })
    }

    fn create_contact_channel<'a>(
        &'a self,
        contact_id: &'a str,
        name: &'a str,
        r#type: ChannelType,
        delivery_address: &'a DeliveryAddress,
    ) -> ApiFuture<'a, String> {
        Box::pin(async move {
            let out = self
                .create_contact_channel()
                .contact_id(contact_id)
                .name(name)
                .r#type(sdk::ChannelType::from(r#type.as_str()))
                .delivery_address(sdk_address(delivery_address))
                .defer_activation(true)
                .send()
                .await
                .map_err(ApiError::from)?;
            Ok(out.contact_channel_arn)
        })
    }

    fn get_contact_channel<'a>(&'a self, arn: &'a str) -> ApiFuture<'a, ContactChannelOutput> {
        Box::pin(async move {
            let out = self
                .get_contact_channel()
                .contact_channel_id(arn)
                .send()
                .await
                .map_err(ApiError::from)?;
            let activation_status = match out.activation_status {
                Some(sdk::ActivationStatus::Activated) => ActivationStatus::Activated,
                _ => ActivationStatus::NotActivated,
            };
            Ok(ContactChannelOutput {
                arn: out.contact_channel_arn,
                contact_id: out.contact_arn,
                name: out.name,
                r#type: ChannelType::from(out.r#type.as_str()),
                delivery_address: delivery_address(out.delivery_address),
                activation_status,
            })
        })
    }

    fn update_contact_channel<'a>(
        &'a self,
        arn: &'a str,
        name: &'a str,
        delivery_address: &'a DeliveryAddress,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            self.update_contact_channel()
                .contact_channel_id(arn)
                .name(name)
                .delivery_address(sdk_address(delivery_address))
                .send()
                .await
                .map_err(ApiError::from)?;
            Ok(())
        })
    }

    fn delete_contact_channel<'a>(&'a self, arn: &'a str) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            self.delete_contact_channel()
                .contact_channel_id(arn)
                .send()
                .await
                .map_err(ApiError::from)?;
            Ok(())
        })
    }
}
