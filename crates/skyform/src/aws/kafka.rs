//! Tagging for Amazon MSK (Kafka) resources.
//!
//! MSK tags are a plain string map on the wire, keyed by the resource ARN.
use std::collections::HashMap;

use crate::{
    api::{ApiError, ApiFuture},
    tags::{KeyValueTags, TagService},
};

/// Tags as MSK takes them. A tag without a value is sent with an empty one.
pub fn tags(tags: &KeyValueTags) -> HashMap<String, String> {
    tags.map().into_iter().collect()
}

/// Tags as MSK returns them.
pub fn key_value_tags(tags: HashMap<String, String>) -> KeyValueTags {
    tags.into_iter().collect()
}

impl TagService for aws_sdk_kafka::Client {
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
                .set_tags(Some(self::tags(tags)))
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

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        aws::fake::FakeCloud,
        tags::{reconcile, update_tags, TagPolicy},
    };

    #[test]
    fn missing_values_are_sent_empty() {
        let mut kv = KeyValueTags::new().with("Name", "cluster");
        kv.insert("Flag", None);
        let wire = tags(&kv);
        assert_eq!(Some(&String::new()), wire.get("Flag"));
        assert_eq!(Some(&"cluster".to_owned()), wire.get("Name"));

        let back = key_value_tags(wire);
        assert_eq!(Some(Some("")), back.get("Flag"));
    }

    #[test]
    fn tags_without_values_settle_after_read_back() {
        let mut desired = KeyValueTags::new().with("Name", "cluster");
        desired.insert("Flag", None);
        let observed = key_value_tags(tags(&desired));
        let plan = reconcile(&observed, &desired, &TagPolicy::aws());
        assert!(plan.is_empty(), "{plan:?}");
    }

    #[tokio::test]
    async fn cluster_tags_reconcile_through_the_provider() {
        let _ = env_logger::builder().is_test(true).try_init();
        let fake = Arc::new(FakeCloud::default());
        let aws = fake.aws();
        let arn = "arn:aws:kafka:us-west-2:000000000000:cluster/tf-acc-test/1";

        let first = KeyValueTags::new().with("key1", "value1").with("key2", "value2");
        update_tags(aws.kafka(), arn, &KeyValueTags::new(), &first)
            .await
            .unwrap();
        let second = KeyValueTags::new().with("key1", "value1updated");
        update_tags(aws.kafka(), arn, &first, &second)
            .await
            .unwrap();

        assert_eq!(second, aws.kafka().list_tags(arn).await.unwrap());
        assert_eq!(
            vec!["TagResource", "UntagResource", "TagResource"],
            fake.calls()
        );

        update_tags(aws.kafka(), arn, &second, &second)
            .await
            .unwrap();
        assert_eq!(3, fake.calls().len());
    }
}
