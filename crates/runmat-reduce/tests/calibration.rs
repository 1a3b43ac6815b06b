use std::sync::Arc;
use std::time::Duration;

use runmat_reduce::tuning::{DeviceWorkload, Workload};
use runmat_reduce::{
    CalibrationConfig, Calibrator, CostModel, DType, HostDevice, KernelDevice, ReduceError,
    ReduceOptions, ReductionEngine, Result, TableStore, TunedOp,
};

/// Synthetic workload with a scripted cost per point.
struct Scripted<F: FnMut(u8, &[u32]) -> Result<Duration>> {
    op: TunedOp,
    modes: Vec<u8>,
    calls: Vec<(u8, Vec<u32>)>,
    cost: F,
}

impl<F: FnMut(u8, &[u32]) -> Result<Duration>> Workload for Scripted<F> {
    fn op(&self) -> TunedOp {
        self.op
    }

    fn modes(&self) -> Vec<u8> {
        self.modes.clone()
    }

    fn run_once(&mut self, mode: u8, dims: &[u32]) -> Result<Duration> {
        self.calls.push((mode, dims.to_vec()));
        (self.cost)(mode, dims)
    }
}

fn scripted<F: FnMut(u8, &[u32]) -> Result<Duration>>(
    op: TunedOp,
    modes: &[u8],
    cost: F,
) -> Scripted<F> {
    Scripted {
        op,
        modes: modes.to_vec(),
        calls: Vec::new(),
        cost,
    }
}

fn config(max_rows: u32, max_cols: u32) -> CalibrationConfig {
    CalibrationConfig {
        repeats: 2,
        start: 8,
        max_rows,
        max_cols,
        max_classes: 8,
        budget_secs: 10.0,
        hard_limit_secs: 0.5,
    }
}

#[test]
fn hard_limit_prunes_larger_rows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cal = Calibrator::new(config(256, 8), TableStore::new(dir.path(), "dev"));
    let mut w = scripted(TunedOp::ReduceSum, &[0], |_, dims| {
        Ok(if dims[0] > 64 {
            Duration::from_secs(1)
        } else {
            Duration::from_micros(3)
        })
    });
    let report = cal.run(&mut w).expect("run");
    assert!(report.complete);
    let table = &report.tables[&0];
    assert_eq!(table.get(&[64, 8]), Some(3e-6));
    assert_eq!(table.get(&[128, 8]), Some(1.0));
    assert_eq!(table.get(&[256, 8]), None);
    assert_eq!(report.measured, 5);
    assert!(report.pruned >= 1);
    // the slow point ran its warm-up only
    let slow_calls = w.calls.iter().filter(|(_, d)| d[0] == 128).count();
    assert_eq!(slow_calls, 1);
}

#[test]
fn extrapolation_stops_before_the_budget() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = config(8, 1024);
    cfg.budget_secs = 1e-3;
    let cal = Calibrator::new(cfg, TableStore::new(dir.path(), "dev"));
    // 10us per column: 8 -> 80us, 16 -> 160us, ..., 64 -> 640us, next predicted 1.28ms
    let mut w = scripted(TunedOp::ReduceMax, &[1], |_, dims| {
        Ok(Duration::from_micros(10 * dims[1] as u64))
    });
    let report = cal.run(&mut w).expect("run");
    let table = &report.tables[&1];
    assert!(table.get(&[8, 64]).is_some());
    assert_eq!(table.get(&[8, 128]), None);
    assert_eq!(report.pruned, 1);
}

#[test]
fn failed_points_are_recorded_as_zero() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = TableStore::new(dir.path(), "dev");
    let cal = Calibrator::new(config(32, 8), store.clone());
    let mut w = scripted(TunedOp::ReduceArgMax, &[0, 1], |mode, dims| {
        if mode == 1 && dims[0] == 16 {
            Err(ReduceError::device("kernel timed out"))
        } else {
            Ok(Duration::from_micros(dims[0] as u64))
        }
    });
    let report = cal.run(&mut w).expect("run");
    assert_eq!(report.failed, 1);
    assert_eq!(report.tables[&1].get(&[16, 8]), Some(0.0));
    assert_eq!(report.tables[&1].get(&[32, 8]), Some(32e-6));
    assert_eq!(report.saved.len(), 2);

    let model = CostModel::new(store);
    assert!(model.cost(TunedOp::ReduceArgMax, 1, &[16, 8]).is_infinite());
    assert_eq!(model.cost(TunedOp::ReduceArgMax, 0, &[16, 8]), 16e-6);
}

#[test]
fn interrupted_runs_resume_where_they_stopped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = TableStore::new(dir.path(), "dev");
    let resume = store.resume_path("reduce_sum").expect("resume path");
    let cost = |mode: u8, dims: &[u32]| Ok(Duration::from_micros(dims[0] as u64 + mode as u64));

    let first = Calibrator::new(config(32, 8), store.clone()).with_point_limit(4);
    let mut w = scripted(TunedOp::ReduceSum, &[0, 1], cost);
    let report = first.run(&mut w).expect("run");
    assert!(!report.complete);
    assert_eq!(report.measured, 4);
    assert!(report.saved.is_empty());
    assert!(resume.exists());
    assert!(store.load("reduce_sum", 0).expect("load").is_none());

    let second = Calibrator::new(config(32, 8), store.clone());
    let mut w = scripted(TunedOp::ReduceSum, &[0, 1], cost);
    let report = second.run(&mut w).expect("run");
    assert!(report.complete);
    assert_eq!(report.replayed, 1);
    assert_eq!(report.measured, 2);
    assert!(w.calls.iter().all(|(mode, _)| *mode == 1));
    assert!(!resume.exists());
    let mode1 = store.load("reduce_sum", 1).expect("load").expect("table");
    assert_eq!(mode1.len(), 3);
    assert_eq!(mode1.get(&[8, 8]), Some(9e-6));
}

#[test]
fn resume_file_for_another_op_is_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = TableStore::new(dir.path(), "dev");
    let resume = store.resume_path("reduce_max").expect("resume path");
    std::fs::create_dir_all(resume.parent().expect("parent")).expect("mkdir");
    std::fs::write(
        &resume,
        r#"{"op":"scatter_add","tables":{},"finished":[0],"cursor":null}"#,
    )
    .expect("write");
    let cal = Calibrator::new(config(8, 8), store);
    let mut w = scripted(TunedOp::ReduceMax, &[0], |_, _| {
        Ok(Duration::from_micros(1))
    });
    let report = cal.run(&mut w).expect("run");
    assert!(report.complete);
    assert_eq!(report.measured, 1);
}

#[test]
fn packaged_only_store_cannot_calibrate() {
    let cal = Calibrator::new(config(8, 8), TableStore::packaged_only("dev"));
    let mut w = scripted(TunedOp::ReduceMax, &[0], |_, _| {
        Ok(Duration::from_micros(1))
    });
    assert!(matches!(cal.run(&mut w), Err(ReduceError::Io(_))));
    assert!(w.calls.is_empty());
}

#[test]
fn device_workload_fills_tables_for_every_mode() {
    let dir = tempfile::tempdir().expect("tempdir");
    let device = Arc::new(HostDevice::new());
    let options = ReduceOptions {
        table_dir: Some(dir.path().to_path_buf()),
        device_tag: Some("host-test".into()),
        ..Default::default()
    };
    let engine = ReductionEngine::new(device.clone(), options).expect("engine");
    let store = engine.cost_model().store().clone();
    let live = device.live_buffers();
    {
        let mut cfg = config(16, 16);
        cfg.repeats = 1;
        let cal = Calibrator::new(cfg, store.clone());
        let mut workload =
            DeviceWorkload::new(&engine, TunedOp::ReduceArgMax, DType::F32).expect("workload");
        let report = cal.run(&mut workload).expect("run");
        assert!(report.complete);
        assert_eq!(report.failed, 0);
        assert_eq!(report.saved.len(), 4);
        for mode in TunedOp::ReduceArgMax.modes() {
            assert_eq!(report.tables[&mode].len(), 4, "mode {mode}");
        }
    }
    device.finish().expect("finish");
    assert_eq!(device.live_buffers(), live);

    engine.cost_model().invalidate();
    let args_dims = [16u64, 16];
    for mode in TunedOp::ReduceArgMax.modes() {
        assert!(engine
            .cost_model()
            .cost(TunedOp::ReduceArgMax, mode, &args_dims)
            .is_finite());
    }
}

#[test]
fn scatter_workload_scans_three_dimensions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let device = Arc::new(HostDevice::new());
    let options = ReduceOptions {
        table_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let engine = ReductionEngine::new(device, options).expect("engine");
    let mut cfg = config(8, 16);
    cfg.repeats = 1;
    cfg.max_classes = 16;
    let cal = Calibrator::new(cfg, engine.cost_model().store().clone());
    let mut workload =
        DeviceWorkload::new(&engine, TunedOp::ScatterAdd, DType::F32).expect("workload");
    let report = cal.run(&mut workload).expect("run");
    assert!(report.complete);
    assert_eq!(report.tables.len(), 5);
    assert_eq!(report.tables[&2].arity(), 3);
    assert_eq!(report.tables[&2].len(), 4);
    assert!(report.tables[&4].get(&[8, 16, 8]).expect("point") > 0.0);
}

#[test]
fn bool_workloads_are_rejected() {
    let device = Arc::new(HostDevice::new());
    let dir = tempfile::tempdir().expect("tempdir");
    let options = ReduceOptions {
        table_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let engine = ReductionEngine::new(device, options).expect("engine");
    assert!(DeviceWorkload::new(&engine, TunedOp::ReduceSum, DType::Bool).is_err());
}
