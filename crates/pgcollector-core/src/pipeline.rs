//! One collection run, from server probe to finished snapshot.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::collector::{
    CapabilityProbe, CollectError, QuerySource, QuerySourceSelector, QueryExecutor,
    SchemaCollector, ServerStatsCollector, reset_stats,
};
use crate::config::Config;
use crate::db::Connection;
use crate::snapshot::{Features, PostgresInfo, Snapshot, SnapshotAssembler};
use crate::system::{FileSystem, SystemCollector};

/// Time spent in each phase of the last run.
#[derive(Debug, Clone, Default)]
pub struct CollectTiming {
    pub probe: Duration,
    pub queries: Duration,
    pub system: Duration,
    pub schema: Duration,
    pub server: Duration,
    pub total: Duration,
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct Collection {
    pub snapshot: Snapshot,
    pub source: QuerySource,
    pub timing: CollectTiming,
}

/// Collects everything `config` asks for over one session.
///
/// `system` reads OS metrics; it is skipped when system information is
/// disabled or the run is on a managed host. The session transaction is
/// rolled back before returning, since every statement was a read.
pub fn collect<C: Connection, F: FileSystem>(
    exec: &mut QueryExecutor<C>,
    config: &Config,
    system: Option<&SystemCollector<F>>,
) -> Result<Collection, CollectError> {
    let options = &config.options;
    let total_start = Instant::now();
    let mut timing = CollectTiming::default();

    let start = Instant::now();
    let probe = CapabilityProbe::fetch(exec)?;
    probe.check(exec, config.managed_host)?;
    timing.probe = start.elapsed();
    info!(
        "Connected to {} as {}, server version {}",
        probe.info().database,
        probe.info().user,
        probe.server_version_num()
    );

    let start = Instant::now();
    let (source, queries) =
        QuerySourceSelector::new(&probe, options.query_parameters).select(exec)?;
    timing.queries = start.elapsed();

    let start = Instant::now();
    let system_information = options.system_information && !config.managed_host;
    let system_info = match system {
        Some(collector) if system_information => {
            let data_directory = probe.data_directory(exec)?;
            Some(collector.collect(data_directory.as_deref()))
        }
        _ => None,
    };
    timing.system = start.elapsed();

    let start = Instant::now();
    let schema = SchemaCollector::new(&probe, options.schema()).collect(exec)?;
    timing.schema = start.elapsed();

    let start = Instant::now();
    let server = ServerStatsCollector::new(&probe, options.query_parameters)
        .collect(exec, |stat| options.server_stat_enabled(stat))?;
    timing.server = start.elapsed();

    exec.rollback()?;
    timing.total = total_start.elapsed();
    debug!(?timing, "collection finished");

    let features = Features {
        query_parameters: options.query_parameters,
        system_information: system_info.is_some(),
        query_source: Some(source),
        reset: options.reset,
    };
    let snapshot = SnapshotAssembler::new(config.api_key.as_str()).assemble(
        features,
        queries,
        PostgresInfo::new(schema, probe.info().version.clone(), server),
        system_info,
    );

    Ok(Collection {
        snapshot,
        source,
        timing,
    })
}

/// Resets the counters of `source` when the configuration asks for it.
pub fn reset_if_requested<C: Connection>(
    exec: &mut QueryExecutor<C>,
    config: &Config,
    source: QuerySource,
) -> Result<bool, CollectError> {
    if !config.options.reset {
        return Ok(false);
    }
    debug!(source = %source, "Resetting stats");
    reset_stats(exec, source)?;
    Ok(true)
}
