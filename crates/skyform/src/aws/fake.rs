//! An in-memory AWS account for tests.
//!
//! One [`FakeCloud`] stands in for every service client of an [`Aws`]
//! provider. It keeps resources in maps, answers with the same error codes as
//! the real services and records every mutating call.
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use crate::{
    api::{ApiError, ApiFuture},
    aws::{
        internetmonitor::{
            InternetMonitorApi, Monitor, MonitorOutput, MonitorStatus, MonitorSummary,
            MonitorUpdate,
        },
        ssmcontacts::{
            ActivationStatus, ChannelType, ContactChannelOutput, ContactSummary, ContactType,
            DeliveryAddress, SsmContactsApi,
        },
        ssmincidents::{RegionOutput, ReplicationRegion, ReplicationSetOutput, SsmIncidentsApi},
        Aws, ProviderConfig,
    },
    sweep::Page,
    tags::{KeyValueTags, TagService},
};

pub(crate) const REGION: &str = "us-west-2";
pub(crate) const ACCOUNT: &str = "000000000000";
const PAGE_SIZE: usize = 2;

#[derive(Default)]
struct Inner {
    next_id: u64,
    calls: Vec<&'static str>,
    failures: HashMap<&'static str, ApiError>,
    tags: HashMap<String, KeyValueTags>,
    monitors: BTreeMap<String, MonitorOutput>,
    contacts: BTreeMap<String, ContactSummary>,
    channels: BTreeMap<String, ContactChannelOutput>,
    replication_sets: BTreeMap<String, ReplicationSetOutput>,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn require_replication_set(&self) -> Result<(), ApiError> {
        if self.replication_sets.is_empty() {
            return Err(ApiError::validation(
                "Incident Manager replication set has not been created or has been deleted",
            ));
        }
        Ok(())
    }

    fn page<T: Clone>(items: Vec<T>, next_token: Option<String>) -> Page<T> {
        let start = next_token
            .and_then(|token| token.parse::<usize>().ok())
            .unwrap_or(0);
        let end = (start + PAGE_SIZE).min(items.len());
        Page {
            items: items[start.min(end)..end].to_vec(),
            next_token: (end < items.len()).then(|| end.to_string()),
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeCloud {
    inner: Mutex<Inner>,
}

impl FakeCloud {
    pub fn aws(self: &Arc<Self>) -> Aws {
        self.aws_with(ProviderConfig::default())
    }

    pub fn aws_with(self: &Arc<Self>, config: ProviderConfig) -> Aws {
        Aws::builder(REGION)
            .config(config)
            .kafka(self.clone())
            .internet_monitor(self.clone())
            .ssm_contacts(self.clone())
            .ssm_incidents(self.clone())
            .build()
            .unwrap()
    }

    /// Every mutating call so far, by operation name.
    pub fn calls(&self) -> Vec<&'static str> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Makes every call of `operation` fail with `error`.
    pub fn fail(&self, operation: &'static str, error: ApiError) {
        self.inner.lock().unwrap().failures.insert(operation, error);
    }

    pub fn monitor_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().monitors.keys().cloned().collect()
    }

    pub fn contact_aliases(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.contacts.values().map(|c| c.alias.clone()).collect()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.lock().unwrap().channels.len()
    }

    pub fn replication_set_count(&self) -> usize {
        self.inner.lock().unwrap().replication_sets.len()
    }

    fn op<T: Send + 'static>(
        &self,
        operation: &'static str,
        mutating: bool,
        f: impl FnOnce(&mut Inner) -> Result<T, ApiError>,
    ) -> ApiFuture<'static, T> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(error) = inner.failures.get(operation).cloned() {
            return Box::pin(std::future::ready(Err(error)));
        }
        if mutating {
            inner.calls.push(operation);
        }
        Box::pin(std::future::ready(f(&mut *inner)))
    }
}

impl TagService for FakeCloud {
    fn list_tags<'a>(&'a self, identifier: &'a str) -> ApiFuture<'a, KeyValueTags> {
        self.op("ListTagsForResource", false, |inner| {
            Ok(inner.tags.get(identifier).cloned().unwrap_or_default())
        })
    }

    fn tag_resource<'a>(
        &'a self,
        identifier: &'a str,
        tags: &'a KeyValueTags,
    ) -> ApiFuture<'a, ()> {
        self.op("TagResource", true, |inner| {
            let existing = inner.tags.entry(identifier.to_owned()).or_default();
            *existing = existing.merge(tags);
            Ok(())
        })
    }

    fn untag_resource<'a>(&'a self, identifier: &'a str, keys: &'a [String]) -> ApiFuture<'a, ()> {
        self.op("UntagResource", true, |inner| {
            if let Some(existing) = inner.tags.get_mut(identifier) {
                *existing = KeyValueTags::from_optional(
                    existing
                        .iter()
                        .filter(|(key, _)| !keys.iter().any(|k| k.as_str() == *key))
                        .map(|(key, value)| (key.to_owned(), value.map(str::to_owned))),
                );
            }
            Ok(())
        })
    }
}

impl InternetMonitorApi for FakeCloud {
    fn list_monitors<'a>(
        &'a self,
        next_token: Option<String>,
    ) -> ApiFuture<'a, Page<MonitorSummary>> {
        self.op("ListMonitors", false, |inner| {
            let monitors = inner
                .monitors
                .values()
                .map(|monitor| MonitorSummary {
                    name: monitor.monitor_name.clone(),
                    arn: monitor.arn.clone(),
                    status: monitor.status,
                })
                .collect();
            Ok(Inner::page(monitors, next_token))
        })
    }

    fn create_monitor<'a>(
        &'a self,
        monitor: &'a Monitor,
        tags: &'a KeyValueTags,
    ) -> ApiFuture<'a, String> {
        self.op("CreateMonitor", true, |inner| {
            if inner.monitors.contains_key(&monitor.monitor_name) {
                return Err(ApiError::new(
                    "ConflictException",
                    format!("monitor {} already exists", monitor.monitor_name),
                ));
            }
            let arn = format!(
                "arn:aws:internetmonitor:{REGION}:{ACCOUNT}:monitor/{}",
                monitor.monitor_name
            );
            inner.tags.insert(arn.clone(), tags.clone());
            inner.monitors.insert(
                monitor.monitor_name.clone(),
                MonitorOutput {
                    arn: arn.clone(),
                    monitor_name: monitor.monitor_name.clone(),
                    resources: monitor.resources.clone(),
                    status: MonitorStatus::Active,
                    max_city_networks_to_monitor: monitor.max_city_networks_to_monitor,
                    traffic_percentage_to_monitor: monitor.traffic_percentage_to_monitor,
                    tags: KeyValueTags::new(),
                },
            );
            Ok(arn)
        })
    }

    fn get_monitor<'a>(&'a self, name: &'a str) -> ApiFuture<'a, MonitorOutput> {
        self.op("GetMonitor", false, |inner| {
            let mut monitor = inner
                .monitors
                .get(name)
                .cloned()
                .ok_or_else(|| ApiError::not_found(format!("monitor {name}")))?;
            monitor.tags = inner.tags.get(&monitor.arn).cloned().unwrap_or_default();
            Ok(monitor)
        })
    }

    fn update_monitor<'a>(
        &'a self,
        name: &'a str,
        update: &'a MonitorUpdate,
    ) -> ApiFuture<'a, ()> {
        self.op("UpdateMonitor", true, |inner| {
            let monitor = inner
                .monitors
                .get_mut(name)
                .ok_or_else(|| ApiError::not_found(format!("monitor {name}")))?;
            for resource in update.resources_to_remove.iter() {
                monitor.resources.remove(resource);
            }
            monitor
                .resources
                .extend(update.resources_to_add.iter().cloned());
            if let Some(status) = update.status {
                monitor.status = status;
            }
            if update.max_city_networks_to_monitor.is_some() {
                monitor.max_city_networks_to_monitor = update.max_city_networks_to_monitor;
            }
            if update.traffic_percentage_to_monitor.is_some() {
                monitor.traffic_percentage_to_monitor = update.traffic_percentage_to_monitor;
            }
            Ok(())
        })
    }

    fn delete_monitor<'a>(&'a self, name: &'a str) -> ApiFuture<'a, ()> {
        self.op("DeleteMonitor", true, |inner| {
            let monitor = inner
                .monitors
                .get(name)
                .ok_or_else(|| ApiError::not_found(format!("monitor {name}")))?;
            if monitor.status != MonitorStatus::Inactive {
                return Err(ApiError::validation(
                    "The monitor must be INACTIVE before it can be deleted",
                ));
            }
            let monitor = inner.monitors.remove(name).unwrap();
            inner.tags.remove(&monitor.arn);
            Ok(())
        })
    }
}

impl SsmContactsApi for FakeCloud {
    fn create_contact<'a>(
        &'a self,
        alias: &'a str,
        display_name: Option<&'a str>,
        r#type: ContactType,
        tags: &'a KeyValueTags,
    ) -> ApiFuture<'a, String> {
        self.op("CreateContact", true, |inner| {
            inner.require_replication_set()?;
            if inner.contacts.values().any(|c| c.alias == alias) {
                return Err(ApiError::new(
                    "ConflictException",
                    format!("contact {alias} already exists"),
                ));
            }
            let arn = format!("arn:aws:ssm-contacts:{REGION}:{ACCOUNT}:contact/{alias}");
            inner.tags.insert(arn.clone(), tags.clone());
            inner.contacts.insert(
                arn.clone(),
                ContactSummary {
                    arn: arn.clone(),
                    alias: alias.to_owned(),
                    display_name: display_name.map(str::to_owned),
                    r#type,
                },
            );
            Ok(arn)
        })
    }

    fn get_contact<'a>(&'a self, arn: &'a str) -> ApiFuture<'a, ContactSummary> {
        self.op("GetContact", false, |inner| {
            inner.require_replication_set()?;
            inner
                .contacts
                .get(arn)
                .cloned()
                .ok_or_else(|| ApiError::not_found(format!("contact {arn}")))
        })
    }

    fn update_contact<'a>(
        &'a self,
        arn: &'a str,
        display_name: Option<&'a str>,
    ) -> ApiFuture<'a, ()> {
        self.op("UpdateContact", true, |inner| {
            let contact = inner
                .contacts
                .get_mut(arn)
                .ok_or_else(|| ApiError::not_found(format!("contact {arn}")))?;
            contact.display_name = display_name.map(str::to_owned);
            Ok(())
        })
    }

    fn delete_contact<'a>(&'a self, arn: &'a str) -> ApiFuture<'a, ()> {
        self.op("DeleteContact", true, |inner| {
            inner
                .contacts
                .remove(arn)
                .ok_or_else(|| ApiError::not_found(format!("contact {arn}")))?;
            inner.tags.remove(arn);
            inner.channels.retain(|_, channel| channel.contact_id != arn);
            Ok(())
        })
    }

    fn list_contacts<'a>(
        &'a self,
        next_token: Option<String>,
    ) -> ApiFuture<'a, Page<ContactSummary>> {
        self.op("ListContacts", false, |inner| {
            let contacts = inner.contacts.values().cloned().collect();
            Ok(Inner::page(contacts, next_token))
        })
    }

    fn create_contact_channel<'a>(
        &'a self,
        contact_id: &'a str,
        name: &'a str,
        r#type: ChannelType,
        delivery_address: &'a DeliveryAddress,
    ) -> ApiFuture<'a, String> {
        self.op("CreateContactChannel", true, |inner| {
            let alias = inner
                .contacts
                .get(contact_id)
                .map(|contact| contact.alias.clone())
                .ok_or_else(|| ApiError::not_found(format!("contact {contact_id}")))?;
            let id = inner.next_id();
            let arn =
                format!("arn:aws:ssm-contacts:{REGION}:{ACCOUNT}:contact-channel/{alias}/{id:08}");
            inner.channels.insert(
                arn.clone(),
                ContactChannelOutput {
                    arn: arn.clone(),
                    contact_id: contact_id.to_owned(),
                    name: name.to_owned(),
                    r#type,
                    delivery_address: delivery_address.clone(),
                    activation_status: ActivationStatus::NotActivated,
                },
            );
            Ok(arn)
        })
    }

    fn get_contact_channel<'a>(&'a self, arn: &'a str) -> ApiFuture<'a, ContactChannelOutput> {
        self.op("GetContactChannel", false, |inner| {
            inner.require_replication_set()?;
            inner
                .channels
                .get(arn)
                .cloned()
                .ok_or_else(|| ApiError::not_found(format!("contact channel {arn}")))
        })
    }

    fn update_contact_channel<'a>(
        &'a self,
        arn: &'a str,
        name: &'a str,
        delivery_address: &'a DeliveryAddress,
    ) -> ApiFuture<'a, ()> {
        self.op("UpdateContactChannel", true, |inner| {
            let channel = inner
                .channels
                .get_mut(arn)
                .ok_or_else(|| ApiError::not_found(format!("contact channel {arn}")))?;
            channel.name = name.to_owned();
            channel.delivery_address = delivery_address.clone();
            Ok(())
        })
    }

    fn delete_contact_channel<'a>(&'a self, arn: &'a str) -> ApiFuture<'a, ()> {
        self.op("DeleteContactChannel", true, |inner| {
            inner
                .channels
                .remove(arn)
                .map(|_| ())
                .ok_or_else(|| ApiError::not_found(format!("contact channel {arn}")))
        })
    }
}

impl SsmIncidentsApi for FakeCloud {
    fn create_replication_set<'a>(
        &'a self,
        regions: &'a [ReplicationRegion],
        tags: &'a KeyValueTags,
    ) -> ApiFuture<'a, String> {
        self.op("CreateReplicationSet", true, |inner| {
            if !inner.replication_sets.is_empty() {
                return Err(ApiError::new(
                    "ConflictException",
                    "a replication set already exists",
                ));
            }
            let id = inner.next_id();
            let arn = format!("arn:aws:ssm-incidents::{ACCOUNT}:replication-set/{id:08}");
            inner.tags.insert(arn.clone(), tags.clone());
            inner.replication_sets.insert(
                arn.clone(),
                ReplicationSetOutput {
                    arn: arn.clone(),
                    regions: regions
                        .iter()
                        .map(|region| RegionOutput {
                            name: region.name.clone(),
                            kms_key_arn: region.kms_key_arn.clone(),
                            status: "ACTIVE".to_owned(),
                        })
                        .collect(),
                    status: "ACTIVE".to_owned(),
                    deletion_protected: false,
                    tags: KeyValueTags::new(),
                },
            );
            Ok(arn)
        })
    }

    fn get_replication_set<'a>(&'a self, arn: &'a str) -> ApiFuture<'a, ReplicationSetOutput> {
        self.op("GetReplicationSet", false, |inner| {
            inner
                .replication_sets
                .get(arn)
                .cloned()
                .ok_or_else(|| ApiError::not_found(format!("replication set {arn}")))
        })
    }

    fn delete_replication_set<'a>(&'a self, arn: &'a str) -> ApiFuture<'a, ()> {
        self.op("DeleteReplicationSet", true, |inner| {
            inner
                .replication_sets
                .remove(arn)
                .ok_or_else(|| ApiError::not_found(format!("replication set {arn}")))?;
            inner.tags.remove(arn);
            for contact in std::mem::take(&mut inner.contacts).into_keys() {
                inner.tags.remove(&contact);
            }
            inner.channels.clear();
            Ok(())
        })
    }

    fn list_replication_sets<'a>(
        &'a self,
        next_token: Option<String>,
    ) -> ApiFuture<'a, Page<String>> {
        self.op("ListReplicationSets", false, |inner| {
            let arns = inner.replication_sets.keys().cloned().collect();
            Ok(Inner::page(arns, next_token))
        })
    }
}
