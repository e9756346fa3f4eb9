//! Multi-source merge and pre/post discontinuity reconciliation.

use crate::core::source_stack::SourceStack;
use crate::io::container::ArrayContainer;
use crate::types::{GlacierError, GlacierResult, Period, Source};
use chrono::{Datelike, Utc};
use ndarray::{concatenate, Array3, ArrayView3, Axis};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

/// Which sources the delivery product is built from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductCoverage {
    MultiSource,
    SingleSource(Source),
}

impl fmt::Display for ProductCoverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProductCoverage::MultiSource => write!(f, "multi_source"),
            ProductCoverage::SingleSource(source) => write!(f, "single_source({})", source),
        }
    }
}

/// Merged, time-aligned delivery container of a unit
#[derive(Debug, Clone)]
pub struct DeliveryProduct {
    pub unit: String,
    pub container: ArrayContainer,
    pub coverage: ProductCoverage,
    pub sources: BTreeSet<Source>,
    pub periods: Vec<Period>,
    /// Stacks left out because their grid did not match the product grid
    pub dropped: Vec<(Period, Source)>,
}

impl DeliveryProduct {
    pub fn len(&self) -> usize {
        self.container.len()
    }

    pub fn is_empty(&self) -> bool {
        self.container.is_empty()
    }

    /// Contributing source of each step, in step order
    pub fn step_sources(&self) -> Vec<Source> {
        self.container.steps.iter().map(|s| s.source).collect()
    }

    /// Source contributing the most steps; ties go to the first source
    pub fn dominant_source(&self) -> Option<Source> {
        let mut counts: BTreeMap<Source, usize> = BTreeMap::new();
        for step in &self.container.steps {
            *counts.entry(step.source).or_default() += 1;
        }
        counts
            .into_iter()
            .fold(None, |best: Option<(Source, usize)>, (source, n)| match best {
                Some((_, m)) if m >= n => best,
                _ => Some((source, n)),
            })
            .map(|(source, _)| source)
    }

    /// Tag a product whose run lost a source or a period.
    ///
    /// Coverage becomes `single_source` of the dominant source and the lost
    /// parts are listed in the `missing` attribute.
    pub fn mark_incomplete(&mut self, missing: &[String]) {
        if let Some(source) = self.dominant_source() {
            self.coverage = ProductCoverage::SingleSource(source);
        }
        let attrs = &mut self.container.global_attributes;
        attrs.insert("coverage".to_string(), self.coverage.to_string());
        attrs.insert("missing".to_string(), missing.join(","));
    }

    fn coverage_for(sources: &BTreeSet<Source>) -> ProductCoverage {
        match sources.iter().next() {
            Some(only) if sources.len() == 1 => ProductCoverage::SingleSource(*only),
            _ => ProductCoverage::MultiSource,
        }
    }

    fn annotate(&mut self) {
        let attrs = &mut self.container.global_attributes;
        attrs.insert("unit".to_string(), self.unit.clone());
        attrs.insert("coverage".to_string(), self.coverage.to_string());
        attrs.insert(
            "sources".to_string(),
            self.sources.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(","),
        );
        attrs.insert(
            "periods".to_string(),
            self.periods.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(","),
        );
        attrs.remove("source");
        attrs.remove("period");
        attrs.insert("date_created".to_string(), Utc::now().to_rfc3339());
    }
}

/// Concatenate containers on one grid and order steps by (midpoint, scene 1, source)
fn concat_sorted(containers: &[&ArrayContainer]) -> GlacierResult<ArrayContainer> {
    let first = containers
        .first()
        .ok_or_else(|| GlacierError::Processing("nothing to concatenate".to_string()))?;
    for other in &containers[1..] {
        if !other.grid.is_compatible(&first.grid) {
            return Err(GlacierError::GridMismatch(
                "source containers are on different grids".to_string(),
            ));
        }
    }
    let cat = |pick: fn(&ArrayContainer) -> &Array3<f32>| -> GlacierResult<Array3<f32>> {
        let views: Vec<ArrayView3<'_, f32>> = containers.iter().map(|c| pick(c).view()).collect();
        concatenate(Axis(0), &views).map_err(|e| GlacierError::GridMismatch(e.to_string()))
    };
    let mut global = BTreeMap::new();
    for c in containers {
        for (k, v) in &c.global_attributes {
            global.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    let joined = ArrayContainer {
        grid: first.grid.clone(),
        vx: cat(|c| &c.vx)?,
        vy: cat(|c| &c.vy)?,
        ux: cat(|c| &c.ux)?,
        uy: cat(|c| &c.uy)?,
        steps: containers.iter().flat_map(|c| c.steps.iter().cloned()).collect(),
        global_attributes: global,
    };

    let mut order: Vec<usize> = (0..joined.len()).collect();
    order.sort_by(|a, b| {
        let (sa, sb) = (&joined.steps[*a], &joined.steps[*b]);
        (sa.midpoint(), sa.scene_1_datetime, sa.source, &sa.field_id)
            .cmp(&(sb.midpoint(), sb.scene_1_datetime, sb.source, &sb.field_id))
    });
    Ok(joined.select(&order))
}

/// Combines the provisional products of the two discontinuity periods
pub trait Reconciler: Send + Sync {
    fn name(&self) -> &str;

    fn reconcile(
        &self,
        pre: DeliveryProduct,
        post: DeliveryProduct,
    ) -> GlacierResult<DeliveryProduct>;
}

/// Concatenates both periods without numeric blending; steps keep their period tag
#[derive(Debug, Default, Clone, Copy)]
pub struct ConcatenateReconciler;

impl Reconciler for ConcatenateReconciler {
    fn name(&self) -> &str {
        "concatenate"
    }

    fn reconcile(
        &self,
        pre: DeliveryProduct,
        post: DeliveryProduct,
    ) -> GlacierResult<DeliveryProduct> {
        let container = concat_sorted(&[&pre.container, &post.container])?;
        let sources: BTreeSet<Source> = pre.sources.union(&post.sources).copied().collect();
        let mut periods = pre.periods.clone();
        periods.extend(post.periods.iter().copied().filter(|p| !pre.periods.contains(p)));
        let mut dropped = pre.dropped;
        dropped.extend(post.dropped);
        let mut product = DeliveryProduct {
            unit: pre.unit,
            coverage: DeliveryProduct::coverage_for(&sources),
            container,
            sources,
            periods,
            dropped,
        };
        product.annotate();
        product
            .container
            .global_attributes
            .insert("reconciler".to_string(), self.name().to_string());
        Ok(product)
    }
}

/// Multi-source merge orchestrator
pub struct MergeOrchestrator;

impl MergeOrchestrator {
    /// Merge the source stacks of one period.
    ///
    /// Overlapping steps of different sources are kept as separate steps.
    /// Stacks off the grid of the largest stack are left out and listed in
    /// [`DeliveryProduct::dropped`].
    pub fn merge(unit: &str, stacks: &[SourceStack]) -> GlacierResult<DeliveryProduct> {
        let stacks: Vec<&SourceStack> = stacks.iter().filter(|s| !s.is_empty()).collect();
        let largest = stacks
            .iter()
            .fold(None, |best: Option<&SourceStack>, s| match best {
                Some(b) if b.len() >= s.len() => Some(b),
                _ => Some(*s),
            })
            .ok_or_else(|| GlacierError::MergeImpossible {
                unit: unit.to_string(),
            })?;
        let (stacks, off_grid): (Vec<&SourceStack>, Vec<&SourceStack>) = stacks
            .into_iter()
            .partition(|s| s.container.grid.is_compatible(&largest.container.grid));
        let dropped: Vec<(Period, Source)> = off_grid
            .iter()
            .map(|s| {
                log::warn!(
                    "   {} stack of {} ({} steps) is off the {} grid, left out of the merge",
                    s.source,
                    unit,
                    s.len(),
                    largest.source
                );
                (s.period, s.source)
            })
            .collect();
        let sources: BTreeSet<Source> = stacks.iter().map(|s| s.source).collect();
        let mut periods: Vec<Period> = Vec::new();
        for stack in &stacks {
            if !periods.contains(&stack.period) {
                periods.push(stack.period);
            }
        }
        let coverage = DeliveryProduct::coverage_for(&sources);
        log::info!("🔀 Merging {} source stack(s) for {}: {}", stacks.len(), unit, coverage);

        let containers: Vec<&ArrayContainer> = stacks.iter().map(|s| &s.container).collect();
        let container = concat_sorted(&containers)?;
        let mut product = DeliveryProduct {
            unit: unit.to_string(),
            container,
            coverage,
            sources,
            periods,
            dropped,
        };
        product.annotate();
        Ok(product)
    }

    /// Fold period products through the reconciler; a single product passes through
    pub fn reconcile_periods(
        products: Vec<DeliveryProduct>,
        reconciler: &dyn Reconciler,
    ) -> GlacierResult<DeliveryProduct> {
        let mut iter = products.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| {
                GlacierError::Processing("no period products to reconcile".to_string())
            })?;
        iter.try_fold(first, |acc, next| {
            log::info!(
                "   Reconciling {:?} with {:?} ({})",
                acc.periods,
                next.periods,
                reconciler.name()
            );
            reconciler.reconcile(acc, next)
        })
    }

    /// Steps grouped by the calendar year of their midpoint
    pub fn split_by_year(product: &DeliveryProduct) -> BTreeMap<i32, ArrayContainer> {
        let mut by_year: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
        for (i, step) in product.container.steps.iter().enumerate() {
            by_year.entry(step.midpoint().year()).or_default().push(i);
        }
        by_year
            .into_iter()
            .map(|(year, idx)| {
                let mut container = product.container.select(&idx);
                container.global_attributes.insert("year".to_string(), year.to_string());
                (year, container)
            })
            .collect()
    }

    /// Write `<unit>_v<version>.npz` and, optionally, `<unit>_<year>_v<version>.npz`
    pub fn deliver(
        product: &DeliveryProduct,
        delivery_dir: &Path,
        version: &str,
        split_by_year: bool,
    ) -> GlacierResult<Vec<PathBuf>> {
        let mut written = Vec::new();
        let path = delivery_dir.join(format!("{}_v{}.npz", product.unit, version));
        product.container.write(&path)?;
        written.push(path);
        if split_by_year {
            for (year, container) in Self::split_by_year(product) {
                let path = delivery_dir.join(format!("{}_{}_v{}.npz", product.unit, year, version));
                container.write(&path)?;
                written.push(path);
            }
        }
        log::info!(
            "📦 Delivered {} ({} steps, {})",
            product.unit,
            product.len(),
            product.coverage
        );
        Ok(written)
    }
}
