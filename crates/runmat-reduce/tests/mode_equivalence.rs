use std::sync::Arc;

use runmat_reduce::{
    AxisArgs, AxisMode, BufferHandle, DType, HostData, HostDevice, KernelDevice, ReduceError,
    ReduceOptions, ReductionEngine, ScatterArgs, ScatterMode,
};

fn engine(device: &Arc<HostDevice>) -> (ReductionEngine, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let options = ReduceOptions {
        table_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let engine = ReductionEngine::new(device.clone(), options).expect("engine");
    (engine, dir)
}

fn sample(total: usize) -> Vec<i32> {
    (0..total)
        .map(|i| ((i * 31 + 7) % 23) as i32 - 11)
        .collect()
}

/// Host reference: sum, max, and first arg-max along the middle axis.
fn reference(
    data: &[i32],
    outer: usize,
    len: usize,
    inner: usize,
) -> (Vec<i32>, Vec<i32>, Vec<u32>) {
    let mut sums = Vec::new();
    let mut maxs = Vec::new();
    let mut args = Vec::new();
    for o in 0..outer {
        for i in 0..inner {
            let at = |j: usize| data[(o * len + j) * inner + i];
            let mut sum = 0;
            let mut best = 0;
            for j in 0..len {
                sum += at(j);
                if at(j) > at(best) {
                    best = j;
                }
            }
            sums.push(sum);
            maxs.push(at(best));
            args.push(best as u32);
        }
    }
    (sums, maxs, args)
}

fn check_axis_modes(
    device: &Arc<HostDevice>,
    engine: &ReductionEngine,
    shape: (usize, usize, usize),
) {
    let (outer, len, inner) = shape;
    let data = sample(outer * len * inner);
    let (sums, maxs, args) = reference(&data, outer, len, inner);
    let src = device.upload(&HostData::I32(data)).expect("upload");
    let rows = outer * inner;
    let sum_dst = device.allocate(rows, DType::I32).expect("alloc");
    let max_dst = device.allocate(rows, DType::I32).expect("alloc");
    let arg_dst = device.allocate(rows, DType::U32).expect("alloc");
    for mode in AxisMode::ALL {
        let a = engine
            .reduce_sum_with_mode(&AxisArgs::new(src, sum_dst, outer, len, inner), mode, &[])
            .expect("sum");
        let b = engine
            .reduce_max_with_mode(&AxisArgs::new(src, max_dst, outer, len, inner), mode, &[a])
            .expect("max");
        let c = engine
            .reduce_arg_max_with_mode(&AxisArgs::new(src, arg_dst, outer, len, inner), mode, &[b])
            .expect("argmax");
        device.wait(&[c]).expect("wait");
        let read = |b: &BufferHandle| device.read(b).expect("read");
        assert_eq!(
            read(&sum_dst).as_i32().expect("i32"),
            &sums[..],
            "sum {mode:?} {shape:?}"
        );
        assert_eq!(
            read(&max_dst).as_i32().expect("i32"),
            &maxs[..],
            "max {mode:?} {shape:?}"
        );
        assert_eq!(
            read(&arg_dst).as_u32().expect("u32"),
            &args[..],
            "argmax {mode:?} {shape:?}"
        );
    }
}

#[test]
fn axis_modes_agree() {
    let device = Arc::new(HostDevice::new());
    let (engine, _dir) = engine(&device);
    for shape in [(1, 1, 1), (4, 7, 1), (3, 1000, 5), (2, 300, 3), (1, 70_000, 1), (600, 9, 1)] {
        check_axis_modes(&device, &engine, shape);
    }
}

#[test]
fn axis_modes_agree_with_small_groups_and_split_grids() {
    let device = Arc::new(HostDevice::new().with_max_workgroup(16).with_max_groups_per_dim(8));
    let (engine, _dir) = engine(&device);
    for shape in [(5, 17, 3), (1, 4_000, 1), (37, 40, 2)] {
        check_axis_modes(&device, &engine, shape);
    }
    assert!(device.launches().iter().all(|l| l.grid.iter().all(|&g| g <= 8)));
}

#[test]
fn zero_outputs_complete_without_launches() {
    let device = Arc::new(HostDevice::new());
    let (engine, _dir) = engine(&device);
    let src = device.allocate(0, DType::F32).expect("alloc");
    let dst = device.allocate(0, DType::F32).expect("alloc");
    device.clear_launches();
    let ev = engine
        .reduce_sum(&AxisArgs::new(src, dst, 0, 12, 4), &[])
        .expect("sum");
    device.wait(&[ev]).expect("wait");
    assert!(device.launches().is_empty());
}

#[test]
fn empty_axis_is_a_configuration_error() {
    let device = Arc::new(HostDevice::new());
    let (engine, _dir) = engine(&device);
    let src = device.allocate(0, DType::F32).expect("alloc");
    let dst = device.allocate(3, DType::F32).expect("alloc");
    let err = engine
        .reduce_max(&AxisArgs::rows(src, dst, 3, 0), &[])
        .unwrap_err();
    assert!(matches!(err, ReduceError::InvalidShape { .. }));
}

struct ScatterCase {
    n: usize,
    k: usize,
    classes: usize,
    indices: Vec<u32>,
    addend: Vec<f32>,
}

impl ScatterCase {
    fn new(n: usize, k: usize, classes: usize, out_of_range: bool) -> Self {
        let indices = (0..n)
            .map(|i| {
                if out_of_range && i % 9 == 4 {
                    (classes + i % 2) as u32
                } else {
                    ((i * 5) % classes) as u32
                }
            })
            .collect();
        let addend = (0..n * k).map(|i| (i % 13) as f32 - 6.0).collect();
        Self {
            n,
            k,
            classes,
            indices,
            addend,
        }
    }

    fn expected(&self, initial: &[f32]) -> Vec<f32> {
        let mut acc = initial.to_vec();
        for (row, &class) in self.indices.iter().enumerate() {
            let class = class as usize;
            if class >= self.classes {
                continue;
            }
            for c in 0..self.k {
                acc[class * self.k + c] += self.addend[row * self.k + c];
            }
        }
        acc
    }

    fn run(&self, device: &HostDevice, engine: &ReductionEngine, mode: ScatterMode) -> Vec<f32> {
        let initial: Vec<f32> = (0..self.classes * self.k).map(|i| i as f32).collect();
        let indices = device
            .upload(&HostData::U32(self.indices.clone()))
            .expect("upload");
        let addend = device
            .upload(&HostData::F32(self.addend.clone()))
            .expect("upload");
        let acc = device
            .upload(&HostData::F32(initial.clone()))
            .expect("upload");
        let args = ScatterArgs::new(self.n, self.k, self.classes, indices, addend, acc)
            .validated(mode == ScatterMode::AtomicUnchecked);
        let ev = engine
            .scatter_add_with_mode(&args, mode, &[])
            .expect("scatter");
        device.wait(&[ev]).expect("wait");
        let got = device
            .read(&acc)
            .expect("read")
            .as_f32()
            .expect("f32")
            .to_vec();
        assert_eq!(got, self.expected(&initial), "{mode:?}");
        got
    }
}

#[test]
fn scatter_modes_agree() {
    let device = Arc::new(HostDevice::new());
    let (engine, _dir) = engine(&device);
    for (n, k, classes) in [(1, 1, 1), (50, 3, 7), (1_000, 1, 10), (300, 40, 5)] {
        let case = ScatterCase::new(n, k, classes, false);
        for mode in ScatterMode::ALL {
            case.run(&device, &engine, mode);
        }
    }
}

#[test]
fn checked_scatter_skips_out_of_range_rows() {
    let device = Arc::new(HostDevice::new());
    let (engine, _dir) = engine(&device);
    let case = ScatterCase::new(200, 4, 6, true);
    assert!(case.indices.iter().any(|&c| c as usize == case.classes));
    for mode in ScatterMode::ALL.into_iter().filter(|m| m.checked()) {
        case.run(&device, &engine, mode);
    }
}

#[test]
fn unchecked_scatter_requires_validated_indices() {
    let device = Arc::new(HostDevice::new());
    let (engine, _dir) = engine(&device);
    let indices = device.upload(&HostData::U32(vec![0, 1])).expect("upload");
    let addend = device
        .upload(&HostData::F32(vec![1.0, 2.0]))
        .expect("upload");
    let acc = device.allocate(2, DType::F32).expect("alloc");
    let args = ScatterArgs::new(2, 1, 2, indices, addend, acc);
    let err = engine
        .scatter_add_with_mode(&args, ScatterMode::AtomicUnchecked, &[])
        .unwrap_err();
    assert!(matches!(err, ReduceError::ModeUnavailable { mode: 4, .. }));
}

#[test]
fn f64_scatter_avoids_atomic_modes() {
    let device = Arc::new(HostDevice::new());
    let (engine, _dir) = engine(&device);
    let indices = device
        .upload(&HostData::U32(vec![1, 0, 1]))
        .expect("upload");
    let addend = device
        .upload(&HostData::F64(vec![0.5, 1.5, 2.0]))
        .expect("upload");
    let acc = device.allocate(2, DType::F64).expect("alloc");
    let args = ScatterArgs::new(3, 1, 2, indices, addend, acc);
    let err = engine
        .scatter_add_with_mode(&args, ScatterMode::AtomicElement, &[])
        .unwrap_err();
    assert!(err.is_configuration());
    assert_eq!(engine.select_scatter_mode(&args).expect("select"), 1);
    engine.scatter_add(&args, &[]).expect("scatter");
    assert_eq!(
        device.read(&acc).expect("read"),
        HostData::F64(vec![1.5, 2.5])
    );
}

/// f32 sums may differ by association order; allow 1e-3 of the row's absolute mass.
const F32_SUM_TOLERANCE: f64 = 1e-3;

#[test]
fn f32_axis_modes_agree_within_tolerance() {
    let device = Arc::new(HostDevice::new());
    let (engine, _dir) = engine(&device);
    for (outer, len, inner) in [(4, 7, 1), (3, 1000, 5), (2, 300, 3), (1, 9_000, 1), (600, 9, 1)] {
        let total = outer * len * inner;
        let data: Vec<f32> = (0..total)
            .map(|i| ((i * 37) % 101) as f32 * 0.173 - 8.0)
            .collect();
        let src = device.upload(&HostData::F32(data.clone())).expect("upload");
        let rows = outer * inner;
        let sum_dst = device.allocate(rows, DType::F32).expect("alloc");
        let max_dst = device.allocate(rows, DType::F32).expect("alloc");
        let arg_dst = device.allocate(rows, DType::U32).expect("alloc");
        for mode in AxisMode::ALL {
            let shape = |dst| AxisArgs::new(src, dst, outer, len, inner);
            engine
                .reduce_sum_with_mode(&shape(sum_dst), mode, &[])
                .expect("sum");
            engine
                .reduce_max_with_mode(&shape(max_dst), mode, &[])
                .expect("max");
            engine
                .reduce_arg_max_with_mode(&shape(arg_dst), mode, &[])
                .expect("argmax");
            let sums = device.read(&sum_dst).expect("read");
            let maxs = device.read(&max_dst).expect("read");
            let args = device.read(&arg_dst).expect("read");
            for o in 0..outer {
                for i in 0..inner {
                    let row = o * inner + i;
                    let column: Vec<f32> =
                        (0..len).map(|j| data[(o * len + j) * inner + i]).collect();
                    let want: f64 = column.iter().map(|&v| v as f64).sum();
                    let mass: f64 = column.iter().map(|&v| (v as f64).abs()).sum();
                    let got = sums.as_f32().expect("f32")[row] as f64;
                    assert!(
                        (got - want).abs() <= F32_SUM_TOLERANCE * mass.max(1.0),
                        "sum {mode:?} row {row}: {got} vs {want}"
                    );
                    let mut best = 0;
                    for (j, &v) in column.iter().enumerate() {
                        if v > column[best] {
                            best = j;
                        }
                    }
                    let at = format!("{mode:?} ({outer}, {len}, {inner}) row {row}");
                    assert_eq!(maxs.as_f32().expect("f32")[row], column[best], "max {at}");
                    assert_eq!(args.as_u32().expect("u32")[row], best as u32, "argmax {at}");
                }
            }
        }
    }
}
