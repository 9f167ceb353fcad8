use std::sync::Arc;

use crate::{
    api::BoxFuture,
    aws::Aws,
    sweep::{
        sweep_candidates, sweep_pages, SweepConfig, SweepError, SweepReport, SweepResource,
        Sweepable, Sweeper,
    },
    Resource,
};

use super::Monitor;

pub const MONITOR_SWEEPER: &str = "aws_internetmonitor_monitor";

pub fn monitor_sweeper() -> Sweeper<Arc<Aws>> {
    Sweeper {
        name: MONITOR_SWEEPER,
        dependencies: &[],
        run: sweep_monitors,
    }
}

fn sweep_monitors<'a>(
    aws: &'a Arc<Aws>,
    region: &'a str,
    config: &'a SweepConfig,
) -> BoxFuture<'a, Result<SweepReport, SweepError>> {
    Box::pin(async move {
        let api = aws.internet_monitor();
        let Some(monitors) =
            sweep_pages(Monitor::kind(), region, |token| api.list_monitors(token)).await?
        else {
            return Ok(SweepReport::skipped(MONITOR_SWEEPER, region));
        };
        let candidates = monitors
            .into_iter()
            .filter(|monitor| config.matches(&monitor.name))
            .map(|monitor| {
                Arc::new(SweepResource::<Monitor>::new(monitor.name, aws.clone())) as Arc<dyn Sweepable>
            })
            .collect();
        sweep_candidates(MONITOR_SWEEPER, region, config, candidates).await
    })
}
