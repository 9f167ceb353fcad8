//! Resource tags and their reconciliation.
//!
//! Tags are reconciled in at most two calls: one untag call for every key
//! that is gone or whose value changed, then one tag call for every key that
//! is new or whose value changed. Keys under a system prefix (`aws:`) are
//! owned by AWS and never touched.
use std::collections::{BTreeMap, BTreeSet};

use snafu::prelude::*;

use crate::{
    api::{ApiError, ApiFuture, Classify, ErrorClass},
    HasDependencies,
};

/// An ordered set of tags, mapping keys to optional values.
///
/// `None` means the tag has no value. Wire formats that cannot carry a missing
/// value send an empty one instead, so the two compare equal.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct KeyValueTags(BTreeMap<String, Option<String>>);

impl HasDependencies for KeyValueTags {}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for KeyValueTags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), Some(v.into())))
                .collect(),
        )
    }
}

impl KeyValueTags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags from pairs whose values may be missing.
    pub fn from_optional(pairs: impl IntoIterator<Item = (String, Option<String>)>) -> Self {
        Self(pairs.into_iter().collect())
    }

    /// Adds a tag, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, Some(value.into()));
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Option<String>) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Option<&str>> {
        self.0.get(key).map(Option::as_deref)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// Tags as a plain map, with missing values as empty strings.
    pub fn map(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), v.clone().unwrap_or_default()))
            .collect()
    }

    fn filter(&self, keep: impl Fn(&str) -> bool) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(k, _)| keep(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Whether `key` has the same value here and in `other`, a missing value
    /// counting as empty.
    fn same_value(&self, other: &Self, key: &str) -> bool {
        match (self.0.get(key), other.0.get(key)) {
            (Some(here), Some(there)) => {
                here.as_deref().unwrap_or_default() == there.as_deref().unwrap_or_default()
            }
            _ => false,
        }
    }

    /// Tags in `self` that do not survive into `new` with an identical value.
    pub fn removed(&self, new: &Self) -> Self {
        self.filter(|k| !self.same_value(new, k))
    }

    /// Tags in `new` that are absent from `self` or have a different value.
    pub fn updated(&self, new: &Self) -> Self {
        new.filter(|k| !self.same_value(new, k))
    }

    /// Drops tags under the policy's system prefixes.
    pub fn ignore_system(&self, policy: &TagPolicy) -> Self {
        self.filter(|k| !policy.is_system(k))
    }

    /// Drops tags the provider was configured to ignore.
    pub fn ignore_config(&self, config: &IgnoreConfig) -> Self {
        self.filter(|k| !config.ignores(k))
    }

    /// Merges `other` over `self`, `other` winning on conflicts.
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.0.clone();
        merged.extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self(merged)
    }
}

/// Which tags are owned by the service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagPolicy {
    pub system_prefixes: Vec<String>,
}

impl Default for TagPolicy {
    fn default() -> Self {
        Self::aws()
    }
}

impl TagPolicy {
    /// The policy shared by every AWS service.
    pub fn aws() -> Self {
        Self {
            system_prefixes: vec!["aws:".to_owned()],
        }
    }

    pub fn is_system(&self, key: &str) -> bool {
        self.system_prefixes
            .iter()
            .any(|prefix| key.starts_with(prefix.as_str()))
    }
}

/// Tags the provider leaves alone, as configured by the user.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct IgnoreConfig {
    pub keys: BTreeSet<String>,
    pub key_prefixes: Vec<String>,
}

impl IgnoreConfig {
    pub fn ignores(&self, key: &str) -> bool {
        self.keys.contains(key)
            || self
                .key_prefixes
                .iter()
                .any(|prefix| key.starts_with(prefix.as_str()))
    }
}

/// The calls needed to move a resource from one set of tags to another.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagPlan {
    pub untag: Vec<String>,
    pub tag: KeyValueTags,
}

impl TagPlan {
    pub fn is_empty(&self) -> bool {
        self.untag.is_empty() && self.tag.is_empty()
    }
}

/// Plans the reconciliation of `old` into `new`.
pub fn reconcile(old: &KeyValueTags, new: &KeyValueTags, policy: &TagPolicy) -> TagPlan {
    TagPlan {
        untag: old.removed(new).ignore_system(policy).keys(),
        tag: old.updated(new).ignore_system(policy),
    }
}

#[derive(Debug, Snafu)]
pub enum TagError {
    #[snafu(display("untagging resource ({identifier}): {source}"))]
    Untag {
        identifier: String,
        source: ApiError,
    },

    #[snafu(display("tagging resource ({identifier}): {source}"))]
    Tag {
        identifier: String,
        source: ApiError,
    },

    #[snafu(display("listing tags for resource ({identifier}): {source}"))]
    List {
        identifier: String,
        source: ApiError,
    },
}

impl Classify for TagError {
    fn class(&self) -> ErrorClass {
        match self {
            TagError::Untag { source, .. }
            | TagError::Tag { source, .. }
            | TagError::List { source, .. } => source.class(),
        }
    }
}

/// A service whose resources carry tags, keyed by an identifier (usually the
/// ARN).
pub trait TagService: Send + Sync {
    fn tag_policy(&self) -> TagPolicy {
        TagPolicy::aws()
    }

    fn list_tags<'a>(&'a self, identifier: &'a str) -> ApiFuture<'a, KeyValueTags>;

    fn tag_resource<'a>(
        &'a self,
        identifier: &'a str,
        tags: &'a KeyValueTags,
    ) -> ApiFuture<'a, ()>;

    fn untag_resource<'a>(&'a self, identifier: &'a str, keys: &'a [String]) -> ApiFuture<'a, ()>;
}

/// Moves the tags of the resource at `identifier` from `old` to `new`.
pub async fn update_tags<C: TagService + ?Sized>(
    conn: &C,
    identifier: &str,
    old: &KeyValueTags,
    new: &KeyValueTags,
) -> Result<(), TagError> {
    let plan = reconcile(old, new, &conn.tag_policy());
    if !plan.untag.is_empty() {
        log::debug!("untagging {identifier}: {:?}", plan.untag);
        conn.untag_resource(identifier, &plan.untag)
            .await
            .context(UntagSnafu { identifier })?;
    }
    if !plan.tag.is_empty() {
        log::debug!("tagging {identifier}: {:?}", plan.tag.keys());
        conn.tag_resource(identifier, &plan.tag)
            .await
            .context(TagSnafu { identifier })?;
    }
    Ok(())
}

/// Lists the tags of the resource at `identifier`, without system tags or
/// tags the provider ignores.
pub async fn list_tags<C: TagService + ?Sized>(
    conn: &C,
    identifier: &str,
    ignore: &IgnoreConfig,
) -> Result<KeyValueTags, TagError> {
    let tags = conn
        .list_tags(identifier)
        .await
        .context(ListSnafu { identifier })?;
    Ok(tags.ignore_system(&conn.tag_policy()).ignore_config(ignore))
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Debug, PartialEq)]
    enum Call {
        Untag(Vec<String>),
        Tag(BTreeMap<String, String>),
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Call>>,
        fail_untag: bool,
    }

    impl TagService for Recorder {
        fn list_tags<'a>(&'a self, _identifier: &'a str) -> ApiFuture<'a, KeyValueTags> {
            Box::pin(async { Ok(KeyValueTags::new().with("aws:cloudformation:stack-name", "s")) })
        }

        fn tag_resource<'a>(
            &'a self,
            _identifier: &'a str,
            tags: &'a KeyValueTags,
        ) -> ApiFuture<'a, ()> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(Call::Tag(tags.map()));
                Ok(())
            })
        }

        fn untag_resource<'a>(
            &'a self,
            _identifier: &'a str,
            keys: &'a [String],
        ) -> ApiFuture<'a, ()> {
            Box::pin(async move {
                if self.fail_untag {
                    return Err(ApiError::new("AccessDenied", "nope"));
                }
                self.calls.lock().unwrap().push(Call::Untag(keys.to_vec()));
                Ok(())
            })
        }
    }

    fn tags(pairs: &[(&str, &str)]) -> KeyValueTags {
        pairs.iter().copied().collect()
    }

    #[test]
    fn reconcile_changed_and_added() {
        let old = tags(&[("a", "1"), ("b", "2"), ("aws:cloudformation:stack-name", "s")]);
        let new = tags(&[("a", "1"), ("b", "3"), ("c", "4")]);
        let plan = reconcile(&old, &new, &TagPolicy::aws());
        assert_eq!(vec!["b".to_owned()], plan.untag);
        assert_eq!(tags(&[("b", "3"), ("c", "4")]), plan.tag);
    }

    #[test]
    fn reconcile_is_idempotent() {
        let old = tags(&[("a", "1"), ("b", "2")]);
        assert!(reconcile(&old, &old.clone(), &TagPolicy::aws()).is_empty());
    }

    #[test]
    fn missing_value_equals_empty_value() {
        let mut old = KeyValueTags::new();
        old.insert("k", None);
        let new = tags(&[("k", "")]);
        assert!(reconcile(&old, &new, &TagPolicy::aws()).is_empty());
        assert!(reconcile(&new, &old, &TagPolicy::aws()).is_empty());

        let plan = reconcile(&old, &tags(&[("k", "v")]), &TagPolicy::aws());
        assert_eq!(vec!["k".to_owned()], plan.untag);
        assert_eq!(Some(Some("v")), plan.tag.get("k"));
    }

    #[test]
    fn system_tags_are_never_touched() {
        let old = tags(&[("aws:a", "1")]);
        let new = tags(&[("aws:b", "2")]);
        assert!(reconcile(&old, &new, &TagPolicy::aws()).is_empty());
    }

    #[test]
    fn ignore_config_and_merge() {
        let ignore = IgnoreConfig {
            keys: ["Owner".to_owned()].into_iter().collect(),
            key_prefixes: vec!["kubernetes.io/".to_owned()],
        };
        let t = tags(&[("Owner", "me"), ("kubernetes.io/cluster", "x"), ("Name", "n")]);
        assert_eq!(tags(&[("Name", "n")]), t.ignore_config(&ignore));

        let defaults = tags(&[("Env", "test"), ("Name", "default")]);
        let resource = tags(&[("Name", "mine")]);
        assert_eq!(
            tags(&[("Env", "test"), ("Name", "mine")]),
            defaults.merge(&resource)
        );
    }

    #[tokio::test]
    async fn update_tags_untags_then_tags() {
        let conn = Recorder::default();
        let old = tags(&[("a", "1"), ("gone", "x")]);
        let new = tags(&[("a", "2"), ("new", "y")]);
        update_tags(&conn, "arn:aws:kafka:us-west-2:000:cluster/c", &old, &new)
            .await
            .unwrap();
        let calls = conn.calls.into_inner().unwrap();
        assert_eq!(
            vec![
                Call::Untag(vec!["a".to_owned(), "gone".to_owned()]),
                Call::Tag(
                    [("a", "2"), ("new", "y")]
                        .into_iter()
                        .map(|(k, v)| (k.to_owned(), v.to_owned()))
                        .collect()
                ),
            ],
            calls
        );
    }

    #[tokio::test]
    async fn update_tags_no_op_issues_no_calls() {
        let conn = Recorder::default();
        let old = tags(&[("a", "1")]);
        update_tags(&conn, "id", &old, &old).await.unwrap();
        assert!(conn.calls.into_inner().unwrap().is_empty());
    }

    #[tokio::test]
    async fn untag_failure_aborts_before_tagging() {
        let conn = Recorder {
            fail_untag: true,
            ..Default::default()
        };
        let err = update_tags(&conn, "cluster-1", &tags(&[("a", "1")]), &tags(&[("b", "2")]))
            .await
            .unwrap_err();
        assert_eq!(
            "untagging resource (cluster-1): AccessDenied: nope",
            err.to_string()
        );
        assert!(conn.calls.into_inner().unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_tags_drops_system_tags() {
        let conn = Recorder::default();
        let listed = list_tags(&conn, "id", &IgnoreConfig::default())
            .await
            .unwrap();
        assert!(listed.is_empty());
    }
}
