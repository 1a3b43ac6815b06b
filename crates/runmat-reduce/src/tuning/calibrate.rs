//! Offline calibration: measure every mode over a geometric grid of problem sizes
//! and persist the resulting cost tables.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::bucket::geometric;
use super::table::{CostTable, TableStore};
use super::TunedOp;
use crate::config::CalibrationConfig;
use crate::error::Result;

/// Smallest value recorded for a successful measurement; `0` is reserved for failures.
const MIN_RECORDED_SECS: f64 = 1e-9;

/// Something the calibrator can time.
pub trait Workload {
    fn op(&self) -> TunedOp;

    fn modes(&self) -> Vec<u8> {
        self.op().modes().collect()
    }

    /// Run `mode` once at `dims` and block until it completes.
    fn run_once(&mut self, mode: u8, dims: &[u32]) -> Result<Duration>;
}

/// Last point written to the working tables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub mode: u8,
    pub dims: Vec<u32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ResumeState {
    op: String,
    tables: BTreeMap<u8, CostTable>,
    finished: Vec<u8>,
    cursor: Option<Cursor>,
}

#[derive(Clone, Debug)]
pub struct CalibrationReport {
    pub op: TunedOp,
    pub tables: BTreeMap<u8, CostTable>,
    /// Points timed during this run.
    pub measured: usize,
    /// Points taken from a previous, interrupted run.
    pub replayed: usize,
    /// Points recorded as failed (`0`).
    pub failed: usize,
    /// Dimensions abandoned by extrapolation or the hard limit.
    pub pruned: usize,
    pub complete: bool,
    pub saved: Vec<PathBuf>,
    pub elapsed: Duration,
}

pub struct Calibrator {
    config: CalibrationConfig,
    store: TableStore,
    point_limit: Option<usize>,
}

impl Calibrator {
    pub fn new(config: CalibrationConfig, store: TableStore) -> Self {
        Self {
            config,
            store,
            point_limit: None,
        }
    }

    /// Stop after `limit` fresh measurements, leaving the resume file for the next run.
    pub fn with_point_limit(mut self, limit: usize) -> Self {
        self.point_limit = Some(limit);
        self
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn store(&self) -> &TableStore {
        &self.store
    }

    pub fn run(&self, workload: &mut dyn Workload) -> Result<CalibrationReport> {
        let op = workload.op();
        let resume_path = self.store.resume_path(op.name()).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "calibration needs a writable table directory",
            )
        })?;
        let started = Instant::now();
        let mut state = load_resume(&resume_path, op);
        let mut bounds: SmallVec<[u32; 3]> =
            SmallVec::from_slice(&[self.config.max_rows, self.config.max_cols]);
        if op.arity() == 3 {
            bounds.push(self.config.max_classes);
        }
        info!(
            "calibrating {op}: modes {:?}, bounds {bounds:?}, {} repeats",
            workload.modes(),
            self.config.repeats
        );

        let mut report = CalibrationReport {
            op,
            tables: BTreeMap::new(),
            measured: 0,
            replayed: 0,
            failed: 0,
            pruned: 0,
            complete: false,
            saved: Vec::new(),
            elapsed: Duration::ZERO,
        };
        let mut interrupted = false;
        for mode in workload.modes() {
            if state.finished.contains(&mode) {
                continue;
            }
            let mut scan = Scan {
                cal: self,
                workload: &mut *workload,
                mode,
                arity: op.arity(),
                bounds: &bounds,
                state: &mut state,
                resume_path: &resume_path,
                report: &mut report,
                interrupted: false,
            };
            let mut prefix = SmallVec::new();
            scan.scan(0, &mut prefix);
            if scan.interrupted {
                interrupted = true;
                break;
            }
            state.finished.push(mode);
            state
                .tables
                .entry(mode)
                .or_insert_with(|| CostTable::empty(op.arity()));
            persist_resume(&resume_path, &state);
            info!("{op}: mode {mode} done");
        }

        report.tables = state.tables.clone();
        report.elapsed = started.elapsed();
        if interrupted {
            info!(
                "{op}: calibration paused after {} measurements; progress kept in {}",
                report.measured,
                resume_path.display()
            );
            return Ok(report);
        }
        for (&mode, table) in &state.tables {
            report.saved.push(self.store.save(op.name(), mode, table)?);
        }
        if resume_path.exists() {
            std::fs::remove_file(&resume_path)?;
        }
        report.complete = true;
        info!(
            "{op}: calibration complete in {:.1?} ({} measured, {} failed, {} pruned)",
            report.elapsed, report.measured, report.failed, report.pruned
        );
        Ok(report)
    }

    /// Warm-up run, then the mean of `repeats` timed runs.
    fn measure(&self, workload: &mut dyn Workload, mode: u8, dims: &[u32]) -> Result<f64> {
        let warm = workload.run_once(mode, dims)?.as_secs_f64();
        if warm > self.config.hard_limit_secs {
            return Ok(warm.max(MIN_RECORDED_SECS));
        }
        let repeats = self.config.repeats.max(1);
        let mut total = Duration::ZERO;
        for _ in 0..repeats {
            total += workload.run_once(mode, dims)?;
        }
        Ok((total.as_secs_f64() / repeats as f64).max(MIN_RECORDED_SECS))
    }
}

struct Scan<'a> {
    cal: &'a Calibrator,
    workload: &'a mut dyn Workload,
    mode: u8,
    arity: usize,
    bounds: &'a [u32],
    state: &'a mut ResumeState,
    resume_path: &'a Path,
    report: &'a mut CalibrationReport,
    interrupted: bool,
}

impl Scan<'_> {
    /// Scan dimension `level` with the outer coordinates fixed by `prefix`.
    ///
    /// Returns the first successful cost along the dimension, which stands in for
    /// this whole slice when the enclosing dimension extrapolates.
    fn scan(&mut self, level: usize, prefix: &mut SmallVec<[u32; 3]>) -> Option<f64> {
        let cal = self.cal;
        let config = &cal.config;
        let points: Vec<u32> = geometric(config.start, self.bounds[level]).collect();
        let mut representative = None;
        let mut last: Option<(u32, f64)> = None;
        for (n, &p) in points.iter().enumerate() {
            prefix.push(p);
            let cost = if level + 1 == self.bounds.len() {
                self.point(prefix)
            } else {
                self.scan(level + 1, prefix)
            };
            prefix.pop();
            if self.interrupted {
                return representative;
            }
            let Some(t) = cost else {
                continue;
            };
            representative.get_or_insert(t);
            if t > config.hard_limit_secs {
                log::debug!(
                    "mode {}: {t:.3e}s at {:?}+[{p}] exceeds the hard limit",
                    self.mode,
                    prefix
                );
                self.report.pruned += 1;
                break;
            }
            if let (Some((p0, t0)), Some(&next)) = (last, points.get(n + 1)) {
                let predicted = (t - t0) / (p - p0) as f64 * (next - p) as f64 + t;
                if predicted > config.budget_secs {
                    log::debug!(
                        "mode {}: predicted {predicted:.3e}s at {:?}+[{next}], stopping",
                        self.mode,
                        prefix
                    );
                    self.report.pruned += 1;
                    break;
                }
            }
            last = Some((p, t));
        }
        representative
    }

    fn point(&mut self, dims: &[u32]) -> Option<f64> {
        let recorded = self
            .state
            .tables
            .get(&self.mode)
            .and_then(|table| table.get(dims));
        if let Some(seconds) = recorded {
            self.report.replayed += 1;
            return (seconds > 0.0).then_some(seconds);
        }
        if let Some(limit) = self.cal.point_limit {
            if self.report.measured >= limit {
                self.interrupted = true;
                return None;
            }
        }
        let seconds = match self.cal.measure(&mut *self.workload, self.mode, dims) {
            Ok(seconds) => seconds,
            Err(err) => {
                warn!(
                    "{} mode {} at {dims:?}: measurement failed, recording 0: {err}",
                    self.report.op, self.mode
                );
                self.report.failed += 1;
                0.0
            }
        };
        self.state
            .tables
            .entry(self.mode)
            .or_insert_with(|| CostTable::empty(self.arity))
            .insert(dims, seconds);
        self.state.cursor = Some(Cursor {
            mode: self.mode,
            dims: dims.to_vec(),
        });
        self.report.measured += 1;
        persist_resume(self.resume_path, self.state);
        (seconds > 0.0).then_some(seconds)
    }
}

fn load_resume(path: &Path, op: TunedOp) -> ResumeState {
    let fresh = || ResumeState {
        op: op.name().to_string(),
        ..Default::default()
    };
    if !path.exists() {
        return fresh();
    }
    let parsed = std::fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|data| serde_json::from_str::<ResumeState>(&data).map_err(|e| e.to_string()));
    match parsed {
        Ok(state) if state.op == op.name() => {
            info!(
                "{op}: resuming calibration from {} (last point {:?})",
                path.display(),
                state.cursor
            );
            state
        }
        Ok(state) => {
            warn!(
                "resume file {} belongs to '{}', starting {op} afresh",
                path.display(),
                state.op
            );
            fresh()
        }
        Err(err) => {
            warn!("ignoring unreadable resume file {}: {err}", path.display());
            fresh()
        }
    }
}

fn persist_resume(path: &Path, state: &ResumeState) {
    let write = || -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec(state)?)?;
        Ok(())
    };
    if let Err(err) = write() {
        warn!(
            "could not save calibration progress to {}: {err}",
            path.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Linear {
        calls: usize,
    }

    impl Workload for Linear {
        fn op(&self) -> TunedOp {
            TunedOp::ReduceMax
        }

        fn modes(&self) -> Vec<u8> {
            vec![0]
        }

        fn run_once(&mut self, _mode: u8, dims: &[u32]) -> Result<Duration> {
            self.calls += 1;
            Ok(Duration::from_nanos((dims[0] as u64) * (dims[1] as u64)))
        }
    }

    #[test]
    fn warm_up_plus_repeats_per_point() {
        let dir = tempfile::tempdir().unwrap();
        let config = CalibrationConfig {
            repeats: 3,
            max_rows: 16,
            max_cols: 8,
            ..Default::default()
        };
        let cal = Calibrator::new(config, TableStore::new(dir.path(), "t"));
        let mut w = Linear { calls: 0 };
        let report = cal.run(&mut w).unwrap();
        assert!(report.complete);
        assert_eq!(report.measured, 2);
        assert_eq!(w.calls, 2 * 4);
        let table = &report.tables[&0];
        assert!((table.get(&[16, 8]).unwrap() - 128e-9).abs() < 1e-12);
    }
}
