//! Chain driver: the per-unit state machine over the five stages, and the
//! batch runner that executes units on a worker pool.
//!
//! Stage results are folded into a [`UnitState`] by the pure [`transition`]
//! function, so the graceful/critical policy can be checked without any I/O.
//! A unit never propagates an error or a panic past [`ChainDriver::run_unit`];
//! everything ends up in its [`UnitReport`].

use crate::config::{Criticality, PipelineConfig};
use crate::core::field_correction::{CorrectedField, CorrectionSummary, FieldCorrector};
use crate::core::merge::{ConcatenateReconciler, DeliveryProduct, MergeOrchestrator, Reconciler};
use crate::core::offset_estimation::{OffsetEstimate, OffsetEstimator};
use crate::core::orbit_index::{OrbitIndex, OrbitIndexer};
use crate::core::source_stack::{SourceStack, SourceStacker};
use crate::io::boundary::{BoundaryProvider, JsonBoundaryProvider};
use crate::io::failure_log::{FailureEntry, FailureLog};
use crate::io::field_store::{GeoTiffFieldStore, RawField, RawFieldStore};
use crate::io::masks::{MaskCache, MaskSet};
use crate::io::workspace::{delivery_dir, ArtifactKind, UnitWorkspace};
use crate::types::{GlacierError, GlacierResult, Period, PeriodWindow, Source};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

/// Lifecycle of one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitState {
    Pending,
    OrbitIndexed,
    OffsetsEstimated,
    FieldsCorrected,
    SourcesStacked,
    Merged,
    Delivered,
    PartiallyDelivered,
    Failed,
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitState::Delivered | UnitState::PartiallyDelivered | UnitState::Failed
        )
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitState::Pending => "pending",
            UnitState::OrbitIndexed => "orbit_indexed",
            UnitState::OffsetsEstimated => "offsets_estimated",
            UnitState::FieldsCorrected => "fields_corrected",
            UnitState::SourcesStacked => "sources_stacked",
            UnitState::Merged => "merged",
            UnitState::Delivered => "delivered",
            UnitState::PartiallyDelivered => "partially_delivered",
            UnitState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Pipeline stages; stacking runs once per source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    OrbitIndexing,
    OffsetEstimation,
    FieldCorrection,
    Stacking(Source),
    Merge,
}

impl Stage {
    pub fn criticality(&self, config: &PipelineConfig) -> Criticality {
        match self {
            Stage::OrbitIndexing => config.criticality.orbit_indexing,
            Stage::OffsetEstimation => config.criticality.offset_estimation,
            Stage::FieldCorrection => config.criticality.field_correction,
            Stage::Stacking(source) => config.stacking_criticality(*source),
            Stage::Merge => config.criticality.merge,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::OrbitIndexing => write!(f, "orbit_indexing"),
            Stage::OffsetEstimation => write!(f, "offset_estimation"),
            Stage::FieldCorrection => write!(f, "field_correction"),
            Stage::Stacking(source) => write!(f, "stacking({})", source),
            Stage::Merge => write!(f, "merge"),
        }
    }
}

/// Tag of a stage outcome, all the state machine needs to know
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    Degraded,
    Fatal,
}

/// Result of one stage.
///
/// `Degraded` still carries the stage output; the reason says what was lost.
#[derive(Debug)]
pub enum StageOutcome<T> {
    Success(T),
    Degraded(T, String),
    Fatal(String),
}

impl<T> StageOutcome<T> {
    /// Map a stage result, asking `degraded` whether a successful output lost anything
    pub fn from_result(
        result: GlacierResult<T>,
        degraded: impl FnOnce(&T) -> Option<String>,
    ) -> Self {
        match result {
            Ok(data) => match degraded(&data) {
                Some(reason) => StageOutcome::Degraded(data, reason),
                None => StageOutcome::Success(data),
            },
            Err(e) => StageOutcome::Fatal(e.to_string()),
        }
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            StageOutcome::Success(_) => OutcomeKind::Success,
            StageOutcome::Degraded(..) => OutcomeKind::Degraded,
            StageOutcome::Fatal(_) => OutcomeKind::Fatal,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            StageOutcome::Success(_) => None,
            StageOutcome::Degraded(_, reason) | StageOutcome::Fatal(reason) => Some(reason),
        }
    }

    pub fn into_data(self) -> Option<T> {
        match self {
            StageOutcome::Success(data) | StageOutcome::Degraded(data, _) => Some(data),
            StageOutcome::Fatal(_) => None,
        }
    }
}

/// Next state of a unit after `stage` finished with `outcome`.
///
/// Terminal states never change. A stage reached from the wrong state, or a
/// fatal outcome of a critical stage, fails the unit. Everything else,
/// including a fatal outcome of a graceful stage, advances.
pub fn transition(
    state: UnitState,
    stage: Stage,
    outcome: OutcomeKind,
    criticality: Criticality,
) -> UnitState {
    if state.is_terminal() {
        return state;
    }
    let (expected, next) = match stage {
        Stage::OrbitIndexing => (state == UnitState::Pending, UnitState::OrbitIndexed),
        Stage::OffsetEstimation => (state == UnitState::OrbitIndexed, UnitState::OffsetsEstimated),
        Stage::FieldCorrection => (
            state == UnitState::OffsetsEstimated,
            UnitState::FieldsCorrected,
        ),
        Stage::Stacking(_) => (
            matches!(state, UnitState::FieldsCorrected | UnitState::SourcesStacked),
            UnitState::SourcesStacked,
        ),
        Stage::Merge => (state == UnitState::SourcesStacked, UnitState::Merged),
    };
    if !expected {
        return UnitState::Failed;
    }
    match (outcome, criticality) {
        (OutcomeKind::Fatal, Criticality::Critical) => UnitState::Failed,
        _ => next,
    }
}

/// Terminal state once merging is done
pub fn finalize(state: UnitState, complete: bool) -> UnitState {
    match state {
        UnitState::Merged if complete => UnitState::Delivered,
        UnitState::Merged => UnitState::PartiallyDelivered,
        s if s.is_terminal() => s,
        _ => UnitState::Failed,
    }
}

fn day_start(date: NaiveDate) -> GlacierResult<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| GlacierError::Config(format!("invalid date {}", date)))
}

/// Period windows for `[start, end]`.
///
/// A discontinuity strictly after `start` and no later than `end` splits the
/// range into `[start, discontinuity)` and `[discontinuity, end + 1 day)`.
pub fn plan_periods(
    start: NaiveDate,
    end: NaiveDate,
    discontinuity: Option<NaiveDate>,
) -> GlacierResult<Vec<PeriodWindow>> {
    let begin = day_start(start)?;
    let finish = day_start(end)? + Duration::days(1);
    let split = match discontinuity {
        Some(date) => Some(day_start(date)?).filter(|d| begin < *d && *d < finish),
        None => None,
    };
    Ok(match split {
        Some(boundary) => vec![
            PeriodWindow {
                period: Period::PreDiscontinuity,
                start: begin,
                end: boundary,
            },
            PeriodWindow {
                period: Period::PostDiscontinuity,
                start: boundary,
                end: finish,
            },
        ],
        None => vec![PeriodWindow {
            period: Period::Whole,
            start: begin,
            end: finish,
        }],
    })
}

/// One entry of a unit's stage history
#[derive(Debug, Clone, PartialEq)]
pub struct StageRecord {
    /// `None` for unit-level stages
    pub period: Option<Period>,
    pub stage: Stage,
    pub outcome: OutcomeKind,
    pub reason: Option<String>,
    pub state: UnitState,
}

/// What happened to one unit
#[derive(Debug, Clone)]
pub struct UnitReport {
    pub unit: String,
    pub state: UnitState,
    pub history: Vec<StageRecord>,
    /// Parseable raw fields, one orbit-pair record each
    pub records: usize,
    pub malformed: usize,
    pub out_of_range: usize,
    /// Fields spanning the discontinuity date, in neither period
    pub straddling: usize,
    pub corrected: usize,
    pub excluded: usize,
    pub insufficient_signatures: usize,
    pub missing_sources: Vec<(Period, Source)>,
    pub missing_periods: Vec<Period>,
    pub steps: usize,
    pub coverage: Option<String>,
    pub delivered: Vec<PathBuf>,
    /// Stage and reason of the fatal outcome that failed the unit
    pub failure: Option<(String, String)>,
}

impl UnitReport {
    pub fn new(unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
            state: UnitState::Pending,
            history: Vec::new(),
            records: 0,
            malformed: 0,
            out_of_range: 0,
            straddling: 0,
            corrected: 0,
            excluded: 0,
            insufficient_signatures: 0,
            missing_sources: Vec::new(),
            missing_periods: Vec::new(),
            steps: 0,
            coverage: None,
            delivered: Vec::new(),
            failure: None,
        }
    }

    fn fail(&mut self, stage: &str, reason: String) {
        log::error!("❌ Unit {} failed at {}: {}", self.unit, stage, reason);
        self.state = UnitState::Failed;
        self.failure = Some((stage.to_string(), reason));
    }

    /// All enabled sources and all planned periods contributed
    pub fn is_complete(&self) -> bool {
        self.missing_sources.is_empty() && self.missing_periods.is_empty()
    }

    fn record_index(&mut self, index: &OrbitIndex, windows: &[PeriodWindow], whole: &PeriodWindow) {
        self.records = index.records.len();
        self.malformed = index.malformed.len();
        for record in &index.records {
            let window = record.window();
            if !whole.contains(&window) {
                self.out_of_range += 1;
            } else if windows
                .iter()
                .skip(1)
                .any(|w| PeriodWindow::straddles(&window, w.start))
            {
                self.straddling += 1;
            }
        }
    }

    /// Missing sources as `period/source`, then missing periods
    pub fn missing_labels(&self) -> Vec<String> {
        let mut missing: Vec<String> = self
            .missing_sources
            .iter()
            .map(|(period, source)| format!("{}/{}", period, source))
            .collect();
        missing.extend(self.missing_periods.iter().map(|p| p.to_string()));
        missing
    }

    /// Stage that lost part of a partially delivered unit
    fn partial_stage(&self) -> String {
        let stacking_failed = self
            .history
            .iter()
            .any(|h| matches!(h.stage, Stage::Stacking(_)) && h.outcome == OutcomeKind::Fatal);
        if stacking_failed {
            return "stacking".to_string();
        }
        self.missing_periods
            .first()
            .and_then(|period| self.history.iter().rev().find(|h| h.period == Some(*period)))
            .map(|h| h.stage.to_string())
            .unwrap_or_else(|| Stage::Merge.to_string())
    }

    /// Failure-log line for failed and partially delivered units
    pub fn failure_entry(&self) -> Option<FailureEntry> {
        let (stage, reason) = match self.state {
            UnitState::Failed => self
                .failure
                .clone()
                .unwrap_or_else(|| ("unknown".to_string(), "no reason recorded".to_string())),
            UnitState::PartiallyDelivered => (
                self.partial_stage(),
                format!("missing: {}", self.missing_labels().join(", ")),
            ),
            _ => return None,
        };
        Some(FailureEntry {
            timestamp: Utc::now(),
            unit: self.unit.clone(),
            terminal_state: self.state.to_string(),
            stage,
            reason,
        })
    }
}

/// Apply one stage outcome to `state`, record it, and hand back its output
fn advance<T>(
    state: &mut UnitState,
    period: Option<Period>,
    report: &mut UnitReport,
    stage: Stage,
    outcome: StageOutcome<T>,
    criticality: Criticality,
) -> Option<T> {
    let kind = outcome.kind();
    *state = transition(*state, stage, kind, criticality);
    let reason = outcome.reason().map(str::to_string);
    match (&reason, kind) {
        (Some(r), OutcomeKind::Degraded) => log::warn!("   ⚠️  {} degraded: {}", stage, r),
        (Some(r), OutcomeKind::Fatal) if *state != UnitState::Failed => {
            log::warn!("   ⚠️  {} failed gracefully: {}", stage, r)
        }
        _ => {}
    }
    if *state == UnitState::Failed {
        let why = reason.clone().unwrap_or_else(|| "stage out of order".to_string());
        report.failure = Some((stage.to_string(), why));
    }
    report.history.push(StageRecord {
        period,
        stage,
        outcome: kind,
        reason,
        state: *state,
    });
    if *state == UnitState::Failed {
        return None;
    }
    outcome.into_data()
}

/// Stages 1 to 4 of one period
struct PeriodRun {
    period: Period,
    state: UnitState,
    /// No field fell inside the period window
    empty: bool,
    stacks: Vec<SourceStack>,
}

/// Overall outcome of a batch
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub units: Vec<UnitReport>,
}

impl BatchReport {
    fn with_state(&self, state: UnitState) -> Vec<&UnitReport> {
        self.units.iter().filter(|u| u.state == state).collect()
    }

    pub fn delivered(&self) -> Vec<&UnitReport> {
        self.with_state(UnitState::Delivered)
    }

    pub fn partially_delivered(&self) -> Vec<&UnitReport> {
        self.with_state(UnitState::PartiallyDelivered)
    }

    pub fn failed(&self) -> Vec<&UnitReport> {
        self.with_state(UnitState::Failed)
    }

    pub fn unit(&self, name: &str) -> Option<&UnitReport> {
        self.units.iter().find(|u| u.unit == name)
    }

    /// 0 iff no unit failed
    pub fn exit_code(&self) -> i32 {
        if self.failed().is_empty() {
            0
        } else {
            1
        }
    }
}

/// Drives every unit of a run through the chain
pub struct ChainDriver {
    config: Arc<PipelineConfig>,
    store: Arc<dyn RawFieldStore>,
    boundaries: Arc<dyn BoundaryProvider>,
    reconciler: Arc<dyn Reconciler>,
    failure_log: FailureLog,
}

impl ChainDriver {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn RawFieldStore>,
        boundaries: Arc<dyn BoundaryProvider>,
    ) -> Self {
        let failure_log = FailureLog::new(config.output_dir.join("failures.log"));
        Self {
            config: Arc::new(config),
            store,
            boundaries,
            reconciler: Arc::new(ConcatenateReconciler),
            failure_log,
        }
    }

    /// Driver reading GeoTIFF fields and JSON boundaries from the configured directories
    pub fn from_config(config: PipelineConfig) -> Self {
        let store = Arc::new(GeoTiffFieldStore::from_config(&config));
        let boundaries = Arc::new(JsonBoundaryProvider::new(&config.boundary_dir));
        Self::new(config, store, boundaries)
    }

    pub fn with_reconciler(mut self, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn failure_log(&self) -> &FailureLog {
        &self.failure_log
    }

    /// Configured units, or every unit found for an enabled source
    pub fn units(&self) -> Vec<String> {
        if !self.config.glaciers.is_empty() {
            return self.config.glaciers.clone();
        }
        let mut units = BTreeSet::new();
        for source in self.config.enabled_sources() {
            match self.store.units(source) {
                Ok(found) => units.extend(found),
                Err(e) => log::warn!("Cannot list {} units: {}", source, e),
            }
        }
        units.into_iter().collect()
    }

    /// Run every unit of the configuration
    pub fn run_batch(&self) -> GlacierResult<BatchReport> {
        let units = self.units();
        self.run_units(&units)
    }

    /// Run `units` on a pool of `workers` threads
    pub fn run_units(&self, units: &[String]) -> GlacierResult<BatchReport> {
        log::info!(
            "🚀 Processing {} unit(s) with {} worker(s)",
            units.len(),
            self.config.workers
        );
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .build()
            .map_err(|e| GlacierError::Processing(format!("worker pool: {}", e)))?;
        let reports: Vec<UnitReport> =
            pool.install(|| units.par_iter().map(|u| self.run_unit(u)).collect());
        let batch = BatchReport { units: reports };
        log::info!(
            "✅ Batch finished: {} delivered, {} partially delivered, {} failed",
            batch.delivered().len(),
            batch.partially_delivered().len(),
            batch.failed().len()
        );
        Ok(batch)
    }

    /// Run one unit to a terminal state; panics are caught and reported as failures
    pub fn run_unit(&self, unit: &str) -> UnitReport {
        let report = match catch_unwind(AssertUnwindSafe(|| self.execute_unit(unit))) {
            Ok(report) => report,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                let mut report = UnitReport::new(unit);
                report.fail("panic", message);
                report
            }
        };
        if let Some(entry) = report.failure_entry() {
            if let Err(e) = self.failure_log.append(&entry) {
                log::error!(
                    "Cannot write failure log {}: {}",
                    self.failure_log.path().display(),
                    e
                );
            }
        }
        report
    }

    fn collect_names(&self, unit: &str) -> Vec<(Source, String)> {
        let mut names = Vec::new();
        for source in self.config.enabled_sources() {
            match self.store.list(unit, source) {
                Ok(found) => names.extend(found.into_iter().map(|n| (source, n))),
                Err(e) => log::warn!("   No {} fields listed for {}: {}", source, unit, e),
            }
        }
        names
    }

    fn execute_unit(&self, unit: &str) -> UnitReport {
        let config = &self.config;
        let mut report = UnitReport::new(unit);
        log::info!("🏔️  Processing unit {}", unit);

        let planned = plan_periods(
            config.start_date,
            config.end_date,
            config.merge.discontinuity_date,
        );
        let windows = match planned {
            Ok(w) => w,
            Err(e) => {
                report.fail("planning", e.to_string());
                return report;
            }
        };
        let whole = PeriodWindow {
            period: Period::Whole,
            start: windows[0].start,
            end: windows[windows.len() - 1].end,
        };
        if windows.len() > 1 {
            log::info!("   Discontinuity split: {} periods", windows.len());
        }

        let names = self.collect_names(unit);
        let base = UnitWorkspace::new(&config.output_dir, unit, config.layout, Period::Whole);
        let mut masks: Option<MaskCache> = None;
        let mut stacked = Vec::new();
        let mut empty_periods = 0;
        for window in &windows {
            let run = self.run_period(
                unit,
                &names,
                window,
                &windows,
                &whole,
                &base,
                &mut masks,
                &mut report,
            );
            if run.state == UnitState::Failed {
                // a critical stage in any period blocks the whole unit
                report.state = UnitState::Failed;
                log::error!(
                    "❌ Unit {} failed in the {} period, nothing delivered",
                    unit,
                    run.period
                );
                return report;
            }
            if run.empty {
                empty_periods += 1;
            }
            if run.state == UnitState::SourcesStacked && !run.stacks.is_empty() {
                stacked.push(run);
            } else {
                report.missing_periods.push(run.period);
            }
        }
        if stacked.is_empty() {
            if empty_periods == windows.len() {
                report.fail(
                    &Stage::OrbitIndexing.to_string(),
                    format!(
                        "no parseable fields between {} and {}",
                        config.start_date, config.end_date
                    ),
                );
            } else {
                report.fail(
                    &Stage::Merge.to_string(),
                    GlacierError::MergeImpossible { unit: unit.to_string() }.to_string(),
                );
            }
            return report;
        }

        let mut state = UnitState::SourcesStacked;
        let merged = self.merge_and_deliver(unit, &stacked, &mut report);
        let outcome = StageOutcome::from_result(merged, |_| None);
        let criticality = Stage::Merge.criticality(config);
        let merged = advance(&mut state, None, &mut report, Stage::Merge, outcome, criticality);
        match merged {
            Some((product, paths)) => {
                report.steps = product.len();
                report.coverage = Some(product.coverage.to_string());
                report.delivered = paths;
                report.state = finalize(state, report.is_complete());
            }
            None => {
                let reason = report
                    .history
                    .last()
                    .and_then(|h| h.reason.clone())
                    .unwrap_or_else(|| "merge produced no product".to_string());
                report.fail(&Stage::Merge.to_string(), reason);
            }
        }
        log::info!("🏁 Unit {} finished: {}", unit, report.state);
        report
    }

    #[allow(clippy::too_many_arguments)]
    fn run_period(
        &self,
        unit: &str,
        names: &[(Source, String)],
        window: &PeriodWindow,
        windows: &[PeriodWindow],
        whole: &PeriodWindow,
        base: &UnitWorkspace,
        masks: &mut Option<MaskCache>,
        report: &mut UnitReport,
    ) -> PeriodRun {
        let config = &self.config;
        let period = window.period;
        let workspace = base.with_period(period);
        let mut run = PeriodRun {
            period,
            state: UnitState::Pending,
            empty: false,
            stacks: Vec::new(),
        };

        // 1. orbit metadata
        let stage = Stage::OrbitIndexing;
        let outcome = StageOutcome::from_result(
            OrbitIndexer::build(unit, names, window, self.boundaries.as_ref()).and_then(|index| {
                OrbitIndexer::persist(&index, &workspace)?;
                Ok(index)
            }),
            |index: &OrbitIndex| {
                let mut lost = Vec::new();
                if !index.malformed.is_empty() {
                    lost.push(format!("{} malformed field names", index.malformed.len()));
                }
                if index.is_empty() {
                    lost.push(format!("no fields inside the {} window", period));
                }
                (!lost.is_empty()).then(|| lost.join("; "))
            },
        );
        let criticality = stage.criticality(config);
        let indexed = advance(&mut run.state, Some(period), report, stage, outcome, criticality);
        let Some(index) = indexed else {
            return run;
        };
        if report.records == 0 {
            report.record_index(&index, windows, whole);
        }
        if index.is_empty() {
            run.empty = true;
            return run;
        }
        let fields = self.load_fields(unit, &index);
        let records: Vec<_> = index.selected_records().collect();

        // 2. offsets
        let stage = Stage::OffsetEstimation;
        let correction_enabled = |s: Source| config.correction_enabled(s);
        let outcome = StageOutcome::from_result(
            OffsetEstimator::estimate(&records, &fields, &config.estimation, &correction_enabled)
                .and_then(|estimate| {
                    let previews = config.correction.write_previews;
                    OffsetEstimator::persist(&estimate, unit, &workspace, previews)?;
                    Ok(estimate)
                }),
            |estimate: &OffsetEstimate| {
                let short = estimate.warnings.len();
                (short > 0).then(|| format!("{} signatures below the sample threshold", short))
            },
        );
        let criticality = stage.criticality(config);
        let estimated = advance(&mut run.state, Some(period), report, stage, outcome, criticality);
        let Some(estimate) = estimated else {
            return run;
        };
        report.insufficient_signatures += estimate.warnings.len();

        // 3. correction
        let stage = Stage::FieldCorrection;
        let outcome = StageOutcome::from_result(
            self.mask_cache(unit, base, masks).map(|cache| {
                let summary = FieldCorrector::run(
                    &records,
                    &fields,
                    &estimate,
                    cache,
                    period,
                    &config.correction,
                    &correction_enabled,
                );
                for field in &summary.corrected {
                    if let Err(e) = FieldCorrector::persist(
                        field,
                        unit,
                        &workspace,
                        &config.project,
                        config.correction.write_previews,
                    ) {
                        log::warn!("   Cannot write {}: {}", field.record.field_id, e);
                    }
                }
                summary
            }),
            |summary: &CorrectionSummary| {
                let excluded = summary.excluded_count();
                (excluded > 0).then(|| format!("{} fields excluded", excluded))
            },
        );
        let criticality = stage.criticality(config);
        let corrected = advance(&mut run.state, Some(period), report, stage, outcome, criticality);
        let Some(summary) = corrected else {
            return run;
        };
        report.corrected += summary.corrected.len();
        report.excluded += summary.excluded_count();
        drop(fields);

        // 4. stacking, one source at a time
        let mut by_source: BTreeMap<Source, Vec<CorrectedField>> = BTreeMap::new();
        for field in summary.corrected {
            by_source.entry(field.source()).or_default().push(field);
        }
        for source in config.enabled_sources() {
            let stage = Stage::Stacking(source);
            let fields = by_source.remove(&source).unwrap_or_default();
            let outcome = StageOutcome::from_result(
                SourceStacker::assemble(unit, source, period, fields, &config.project).and_then(
                    |stack| {
                        SourceStacker::write(&stack, &workspace, &config.version)?;
                        Ok(stack)
                    },
                ),
                |stack: &SourceStack| {
                    let off = stack.off_grid.len();
                    (off > 0).then(|| format!("{} fields off the stack grid", off))
                },
            );
            let criticality = stage.criticality(config);
            match advance(&mut run.state, Some(period), report, stage, outcome, criticality) {
                Some(stack) => run.stacks.push(stack),
                None if run.state == UnitState::Failed => return run,
                None => report.missing_sources.push((period, source)),
            }
        }
        run
    }

    /// Masks of the unit, loaded and persisted on first use
    fn mask_cache<'a>(
        &self,
        unit: &str,
        base: &UnitWorkspace,
        masks: &'a mut Option<MaskCache>,
    ) -> GlacierResult<&'a mut MaskCache> {
        if masks.is_none() {
            let set = MaskSet::load(&self.config.mask_dir, unit).map_err(|e| {
                GlacierError::CriticalStage {
                    stage: Stage::FieldCorrection.to_string(),
                    reason: format!("masks unavailable: {}", e),
                }
            })?;
            set.write_all(&base.dir(ArtifactKind::Masks)?)?;
            *masks = Some(MaskCache::new(set));
        }
        masks
            .as_mut()
            .ok_or_else(|| GlacierError::Processing("mask cache not initialised".to_string()))
    }

    /// Load the period's selected fields; unreadable fields are left out
    fn load_fields(&self, unit: &str, index: &OrbitIndex) -> BTreeMap<String, RawField> {
        let mut fields = BTreeMap::new();
        for record in index.selected_records() {
            match self.store.load(unit, record.source, &record.field_id) {
                Ok(field) => {
                    fields.insert(record.field_id.clone(), field);
                }
                Err(e) => log::warn!("   Cannot load {}: {}", record.field_id, e),
            }
        }
        log::debug!("   Loaded {} of {} fields", fields.len(), index.selected_count());
        fields
    }

    /// Merge every stacked period and write the delivery product.
    ///
    /// Sources left out by the merge count as missing; an incomplete unit is
    /// delivered as single-source.
    fn merge_and_deliver(
        &self,
        unit: &str,
        runs: &[PeriodRun],
        report: &mut UnitReport,
    ) -> GlacierResult<(DeliveryProduct, Vec<PathBuf>)> {
        let products = runs
            .iter()
            .map(|run| MergeOrchestrator::merge(unit, &run.stacks))
            .collect::<GlacierResult<Vec<_>>>()?;
        let mut product = MergeOrchestrator::reconcile_periods(products, self.reconciler.as_ref())?;
        report.missing_sources.extend(product.dropped.iter().copied());
        if !report.is_complete() {
            product.mark_incomplete(&report.missing_labels());
        }
        let dir = delivery_dir(&self.config.output_dir)?;
        let split = self.config.merge.split_by_year;
        let paths = MergeOrchestrator::deliver(&product, &dir, &self.config.version, split)?;
        Ok((product, paths))
    }
}
