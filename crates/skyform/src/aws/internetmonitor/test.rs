use std::sync::Arc;

use pretty_assertions::assert_eq;

use crate::{
    acctest::{
        check_destroy, check_exists, check_resource_attr, random_with_prefix, TestCase, TestStep,
        RESOURCE_PREFIX,
    },
    api::Classify,
    aws::{fake::FakeCloud, sweepers},
    sweep::SweepConfig,
};

use super::*;

const VPC_1: &str = "arn:aws:ec2:us-west-2:000000000000:vpc/vpc-1";
const VPC_2: &str = "arn:aws:ec2:us-west-2:000000000000:vpc/vpc-2";

fn monitor(name: &str, resources: &[&str], tags: KeyValueTags) -> Monitor {
    Monitor {
        monitor_name: name.to_owned(),
        resources: resources.iter().map(|r| r.to_string()).collect(),
        tags,
        ..Default::default()
    }
}

#[tokio::test]
async fn monitor_lifecycle() {
    let _ = env_logger::builder().is_test(true).try_init();
    let fake = Arc::new(FakeCloud::default());
    let name = random_with_prefix(RESOURCE_PREFIX);

    TestCase::new("internetmonitor-monitor-lifecycle", fake.aws())
        .step(
            TestStep::config({
                let name = name.clone();
                move |store| {
                    store.resource(
                        "monitor",
                        monitor(&name, &[VPC_1], KeyValueTags::new().with("key1", "value1")),
                    )?;
                    Ok(())
                }
            })
            .check(check_exists::<Monitor>("monitor"))
            .check(check_resource_attr("monitor", "monitor_name", &name))
            .check(check_resource_attr("monitor", "status", "ACTIVE"))
            .check(check_resource_attr("monitor", "resources.#", "1"))
            .check(check_resource_attr("monitor", "tags.key1", "value1")),
        )
        .step(
            TestStep::config({
                let name = name.clone();
                move |store| {
                    store.resource(
                        "monitor",
                        monitor(
                            &name,
                            &[VPC_1, VPC_2],
                            KeyValueTags::new()
                                .with("key1", "value1updated")
                                .with("key2", "value2"),
                        ),
                    )?;
                    Ok(())
                }
            })
            .check(check_resource_attr("monitor", "resources.#", "2"))
            .check(check_resource_attr("monitor", "tags.key1", "value1updated"))
            .check(check_resource_attr("monitor", "tags.key2", "value2")),
        )
        .step(TestStep::import_state_verify::<Monitor>("monitor"))
        .check_destroy(check_destroy::<Monitor>())
        .run()
        .await
        .unwrap();

    assert!(fake.monitor_names().is_empty());
    assert_eq!(
        vec![
            "CreateMonitor",
            "UpdateMonitor",
            "UntagResource",
            "TagResource",
            // deactivation
            "UpdateMonitor",
            "DeleteMonitor",
        ],
        fake.calls()
    );
}

#[tokio::test]
async fn monitor_cannot_be_deleted_while_active() {
    let _ = env_logger::builder().is_test(true).try_init();
    let fake = Arc::new(FakeCloud::default());
    let aws = fake.aws();
    monitor("active", &[VPC_1], KeyValueTags::new())
        .create(&aws)
        .await
        .unwrap();
    let err = aws.internet_monitor().delete_monitor("active").await.unwrap_err();
    assert_eq!(Some("ValidationException"), err.code());

    Monitor::delete(&aws, "active").await.unwrap();
    let err = Monitor::read(&aws, "active").await.unwrap_err();
    assert!(err.is_not_found(), "{err}");
}

fn sweep_config(dry_run: bool) -> SweepConfig {
    SweepConfig {
        dry_run,
        name_prefix: Some(RESOURCE_PREFIX.to_owned()),
        ..Default::default()
    }
}

async fn sweep(fake: &Arc<FakeCloud>, config: &SweepConfig) -> crate::sweep::SweepReport {
    let aws = Arc::new(fake.aws());
    let mut summary = sweepers()
        .run(
            &[crate::aws::fake::REGION.to_owned()],
            &[MONITOR_SWEEPER.to_owned()],
            false,
            config,
            |_| {
                let aws = aws.clone();
                async move { aws }
            },
        )
        .await
        .unwrap();
    assert!(summary.failures.is_empty());
    summary.reports.pop().unwrap()
}

#[tokio::test]
async fn sweeper_deletes_prefixed_monitors_across_pages() {
    let _ = env_logger::builder().is_test(true).try_init();
    let fake = Arc::new(FakeCloud::default());
    let aws = fake.aws();
    for name in ["a", "b", "c"] {
        monitor(&format!("{RESOURCE_PREFIX}-{name}"), &[VPC_1], KeyValueTags::new())
            .create(&aws)
            .await
            .unwrap();
    }
    monitor("production", &[VPC_2], KeyValueTags::new())
        .create(&aws)
        .await
        .unwrap();

    let report = sweep(&fake, &sweep_config(true)).await;
    assert_eq!((3, 0, false), (report.listed, report.deleted, report.skipped));
    assert_eq!(4, fake.monitor_names().len());

    let report = sweep(&fake, &sweep_config(false)).await;
    assert_eq!((3, 3, false), (report.listed, report.deleted, report.skipped));
    assert_eq!(vec!["production".to_owned()], fake.monitor_names());
}

#[tokio::test]
async fn sweeper_skips_unavailable_regions() {
    let _ = env_logger::builder().is_test(true).try_init();
    let fake = Arc::new(FakeCloud::default());
    fake.fail(
        "ListMonitors",
        ApiError::new(
            "UnrecognizedClientException",
            "The security token included in the request is invalid",
        ),
    );
    let report = sweep(&fake, &sweep_config(false)).await;
    assert!(report.skipped);
    assert_eq!(0, report.listed);
}

#[tokio::test]
async fn tag_only_changes_leave_the_monitor_settings_alone() {
    let _ = env_logger::builder().is_test(true).try_init();
    let fake = Arc::new(FakeCloud::default());
    let aws = fake.aws();
    let first = Monitor {
        traffic_percentage_to_monitor: Some(50),
        max_city_networks_to_monitor: Some(100),
        ..monitor("settings", &[VPC_1], KeyValueTags::new())
    };
    let created = first.create(&aws).await.unwrap();

    let tagged = Monitor {
        tags: KeyValueTags::new().with("key1", "value1"),
        ..first.clone()
    };
    let updated = tagged.update(&aws, &first, &created).await.unwrap();
    assert_eq!(vec!["CreateMonitor", "TagResource"], fake.calls());

    let more_traffic = Monitor {
        traffic_percentage_to_monitor: Some(60),
        ..tagged.clone()
    };
    let output = more_traffic.update(&aws, &tagged, &updated).await.unwrap();
    assert_eq!(Some(60), output.traffic_percentage_to_monitor);
    assert_eq!(Some(100), output.max_city_networks_to_monitor);
    assert_eq!(
        vec!["CreateMonitor", "TagResource", "UpdateMonitor"],
        fake.calls()
    );
}
