use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use log::info;
use runmat_reduce::tuning::DeviceWorkload;
use runmat_reduce::{
    Calibrator, DType, HostDevice, KernelDevice, ReduceOptions, ReductionEngine, TunedOp,
};

fn usage() -> &'static str {
    "usage: reduce_calibrate [--op NAME|all] [--dtype f32|f64|i32|u32] [--device host|wgpu]\n\
     \x20                       [--table-dir DIR] [--max-points N] [--repeats N]\n\
     \x20                       [--max-rows N] [--max-cols N] [--max-classes N]"
}

fn value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|pos| args.get(pos + 1))
        .map(String::as_str)
}

fn parse_u32(args: &[String], flag: &str) -> Result<Option<u32>> {
    value(args, flag)
        .map(|raw| {
            raw.parse::<u32>()
                .with_context(|| format!("{flag} expects an unsigned integer, got '{raw}'"))
        })
        .transpose()
}

fn parse_dtype(raw: &str) -> Result<DType> {
    Ok(match raw {
        "f32" => DType::F32,
        "f64" => DType::F64,
        "i32" => DType::I32,
        "u32" => DType::U32,
        other => bail!("unsupported dtype '{other}'"),
    })
}

fn open_device(kind: &str) -> Result<Arc<dyn KernelDevice>> {
    match kind {
        "host" => Ok(Arc::new(HostDevice::new())),
        #[cfg(feature = "wgpu")]
        "wgpu" => {
            let device = runmat_reduce::WgpuDevice::new(Default::default())
                .context("failed to initialise wgpu device")?;
            Ok(Arc::new(device))
        }
        #[cfg(not(feature = "wgpu"))]
        "wgpu" => bail!("built without the 'wgpu' feature"),
        other => bail!("unknown device '{other}'"),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{}", usage());
        return Ok(());
    }

    let ops = match value(&args, "--op").unwrap_or("all") {
        "all" => TunedOp::ALL.to_vec(),
        name => vec![TunedOp::from_name(name)
            .ok_or_else(|| anyhow!("unknown op '{name}'\n{}", usage()))?],
    };
    let dtype = parse_dtype(value(&args, "--dtype").unwrap_or("f32"))?;
    let device = open_device(value(&args, "--device").unwrap_or("host"))?;

    let mut options = ReduceOptions::from_env();
    if let Some(dir) = value(&args, "--table-dir") {
        options.table_dir = Some(PathBuf::from(dir));
    }
    if let Some(n) = parse_u32(&args, "--repeats")? {
        options.calibration.repeats = n.max(1);
    }
    if let Some(n) = parse_u32(&args, "--max-rows")? {
        options.calibration.max_rows = n;
    }
    if let Some(n) = parse_u32(&args, "--max-cols")? {
        options.calibration.max_cols = n;
    }
    if let Some(n) = parse_u32(&args, "--max-classes")? {
        options.calibration.max_classes = n;
    }
    let max_points = parse_u32(&args, "--max-points")?;

    let engine = ReductionEngine::new(device, options).context("failed to build engine")?;
    let store = engine.cost_model().store().clone();
    info!(
        "calibrating {} op(s) for device '{}' into {:?}",
        ops.len(),
        store.device_tag(),
        store.root()
    );

    for op in ops {
        let mut calibrator = Calibrator::new(engine.options().calibration.clone(), store.clone());
        if let Some(limit) = max_points {
            calibrator = calibrator.with_point_limit(limit as usize);
        }
        let mut workload = DeviceWorkload::new(&engine, op, dtype)
            .with_context(|| format!("cannot calibrate {op} for {dtype}"))?;
        let report = calibrator
            .run(&mut workload)
            .with_context(|| format!("calibration of {op} failed"))?;
        info!(
            "{op}: measured={} replayed={} failed={} pruned={} complete={} in {:.2?}",
            report.measured,
            report.replayed,
            report.failed,
            report.pruned,
            report.complete,
            report.elapsed
        );
        for path in &report.saved {
            println!("{}", path.display());
        }
    }
    engine.cost_model().invalidate();
    Ok(())
}
