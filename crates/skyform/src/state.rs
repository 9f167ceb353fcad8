//! Snapshots of stored resources as flat attribute maps.
//!
//! Attributes are the remote output of a resource flattened into dotted
//! keys: `delivery_address.simple_address`, `regions.0.name`. Lists also get a
//! `<key>.#` entry holding their length. Null values are left out, so an unset
//! optional field has no attribute at all.
use std::collections::BTreeMap;

use snafu::OptionExt;

use crate::{Error, MissingStateSnafu, Resource};

/// Flattens a JSON value into dotted attribute keys.
pub fn flatten(value: &serde_json::Value) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::default();
    flatten_into("", value, &mut attributes);
    attributes
}

fn flatten_into(prefix: &str, value: &serde_json::Value, out: &mut BTreeMap<String, String>) {
    let key = |k: &str| {
        if prefix.is_empty() {
            k.to_owned()
        } else {
            format!("{prefix}.{k}")
        }
    };
    match value {
        serde_json::Value::Null => {}
        serde_json::Value::Bool(b) => {
            out.insert(prefix.to_owned(), b.to_string());
        }
        serde_json::Value::Number(n) => {
            out.insert(prefix.to_owned(), n.to_string());
        }
        serde_json::Value::String(s) => {
            out.insert(prefix.to_owned(), s.clone());
        }
        serde_json::Value::Array(items) => {
            out.insert(key("#"), items.len().to_string());
            for (i, item) in items.iter().enumerate() {
                flatten_into(&key(&i.to_string()), item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for (k, v) in map.iter() {
                flatten_into(&key(k), v, out);
            }
        }
    }
}

/// One stored resource.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceState {
    pub name: String,
    pub type_name: Option<String>,
    pub identifier: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl ResourceState {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn is<T: Resource>(&self) -> bool {
        self.type_name.as_deref() == Some(std::any::type_name::<T>())
    }
}

/// Every stored resource, by resource id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct State {
    resources: BTreeMap<String, ResourceState>,
}

impl State {
    pub(crate) fn insert(
        &mut self,
        name: String,
        type_name: Option<String>,
        identifier: Option<String>,
        remote: &serde_json::Value,
    ) {
        let resource = ResourceState {
            name: name.clone(),
            type_name,
            identifier,
            attributes: flatten(remote),
        };
        self.resources.insert(name, resource);
    }

    pub fn get(&self, name: &str) -> Result<&ResourceState, Error> {
        self.resources.get(name).context(MissingStateSnafu { name })
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceState> {
        self.resources.values()
    }

    /// Resources stored as the given type.
    pub fn of_type<T: Resource>(&self) -> impl Iterator<Item = &ResourceState> {
        self.iter().filter(|r| r.is::<T>())
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn flatten_nested() {
        let value = serde_json::json!({
            "arn": "arn:aws:ssm-contacts:us-west-2:000:contact-channel/a/b",
            "delivery_address": { "simple_address": "default@example.com" },
            "regions": [{ "name": "us-west-2", "kms_key_arn": null }],
            "defer_activation": true,
            "retry_interval": 5,
            "description": null
        });
        let expected: BTreeMap<String, String> = [
            ("arn", "arn:aws:ssm-contacts:us-west-2:000:contact-channel/a/b"),
            ("defer_activation", "true"),
            ("delivery_address.simple_address", "default@example.com"),
            ("regions.#", "1"),
            ("regions.0.name", "us-west-2"),
            ("retry_interval", "5"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
        assert_eq!(expected, flatten(&value));
    }

    #[test]
    fn missing_resource_is_an_error() {
        let state = State::default();
        assert!(matches!(
            state.get("channel"),
            Err(Error::MissingState { name }) if name == "channel"
        ));
    }
}
