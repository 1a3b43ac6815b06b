use std::sync::Arc;

use runmat_reduce::{
    DType, HostData, HostDevice, Inject, KernelDevice, ReduceError, ReduceOptions,
    ReductionEngine, Topology,
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

fn values(n: usize) -> Vec<f32> {
    (0..n).map(|i| ((i * 7919) % 97) as f32 - 48.0).collect()
}

fn first_max(data: &[f32]) -> u32 {
    let mut best = 0;
    for (i, &v) in data.iter().enumerate() {
        if v > data[best] {
            best = i;
        }
    }
    best as u32
}

fn first_min(data: &[f32]) -> u32 {
    let mut best = 0;
    for (i, &v) in data.iter().enumerate() {
        if v < data[best] {
            best = i;
        }
    }
    best as u32
}

fn read_u32(device: &HostDevice, buffer: &runmat_reduce::BufferHandle) -> u32 {
    device.read(buffer).expect("read").as_u32().expect("u32")[0]
}

#[test]
fn sum_matches_host_across_topology_boundaries() {
    let device = Arc::new(HostDevice::new());
    let (engine, _dir) = engine(&device);
    assert_eq!(engine.workgroup(), 256);
    for n in [1usize, 7, 8, 9, 255, 256, 257, 65_537, 100_000] {
        let data = values(n);
        let expected: f32 = data.iter().sum();
        let src = device.upload(&HostData::F32(data)).expect("upload");
        let dst = device.allocate(1, DType::F32).expect("alloc");
        let ev = engine.sum(&src, &dst, &[]).expect("sum");
        device.wait(&[ev]).expect("wait");
        let got = device.read(&dst).expect("read").as_f32().expect("f32")[0];
        assert_eq!(got, expected, "n = {n}");
    }
}

#[test]
fn imax_and_imin_report_first_position() {
    let device = Arc::new(HostDevice::new());
    let (engine, _dir) = engine(&device);
    for n in [1usize, 7, 8, 9, 255, 256, 257, 100_000] {
        let data = values(n);
        let src = device.upload(&HostData::F32(data.clone())).expect("upload");
        let imax = device.allocate(1, DType::U32).expect("alloc");
        let imin = device.allocate(1, DType::U32).expect("alloc");
        let a = engine.imax(&src, &imax, &[]).expect("imax");
        let b = engine.imin(&src, &imin, &[a]).expect("imin");
        device.wait(&[b]).expect("wait");
        assert_eq!(read_u32(&device, &imax), first_max(&data), "imax n = {n}");
        assert_eq!(read_u32(&device, &imin), first_min(&data), "imin n = {n}");
    }
}

#[test]
fn equal_maxima_resolve_to_lowest_index() {
    let device = Arc::new(HostDevice::new());
    let (engine, _dir) = engine(&device);
    let mut data = vec![1.0f32; 70_000];
    data[40_000] = 9.0;
    data[513] = 9.0;
    data[69_999] = 9.0;
    let src = device.upload(&HostData::F32(data)).expect("upload");
    let dst = device.allocate(1, DType::U32).expect("alloc");
    for topology in [Topology::Segmented, Topology::TwoPhaseLarge] {
        engine
            .reduce_vector(Inject::ArgMax, Some(topology), &src, &dst, &[])
            .expect("argmax");
        assert_eq!(read_u32(&device, &dst), 513, "{topology:?}");
    }
}

#[test]
fn nan_dominates_arg_reductions() {
    let device = Arc::new(HostDevice::new());
    let (engine, _dir) = engine(&device);
    let mut data = values(1_000);
    data[700] = f32::NAN;
    data[300] = f32::NAN;
    let src = device.upload(&HostData::F32(data)).expect("upload");
    let imax = device.allocate(1, DType::U32).expect("alloc");
    let imin = device.allocate(1, DType::U32).expect("alloc");
    engine.imax(&src, &imax, &[]).expect("imax");
    engine.imin(&src, &imin, &[]).expect("imin");
    assert_eq!(read_u32(&device, &imax), 300);
    assert_eq!(read_u32(&device, &imin), 300);
}

#[test]
fn max_reduction_propagates_nan() {
    let device = Arc::new(HostDevice::new());
    let (engine, _dir) = engine(&device);
    let mut data = values(600);
    data[599] = f32::NAN;
    let src = device.upload(&HostData::F32(data)).expect("upload");
    let dst = device.allocate(1, DType::F32).expect("alloc");
    engine
        .reduce_vector(Inject::Max, None, &src, &dst, &[])
        .expect("max");
    assert!(device.read(&dst).expect("read").as_f32().expect("f32")[0].is_nan());
}

#[test]
fn small_groups_need_more_rounds() {
    let device = Arc::new(HostDevice::new().with_max_workgroup(32));
    let (engine, _dir) = engine(&device);
    assert_eq!(engine.workgroup(), 32);
    for n in [31usize, 32, 33, 1_024, 1_025, 40_000] {
        let data: Vec<i32> = (0..n as i32).map(|i| i % 11 - 5).collect();
        let expected: i32 = data.iter().sum();
        let src = device.upload(&HostData::I32(data)).expect("upload");
        let dst = device.allocate(1, DType::I32).expect("alloc");
        engine.sum(&src, &dst, &[]).expect("sum");
        let got = device.read(&dst).expect("read").as_i32().expect("i32")[0];
        assert_eq!(got, expected, "n = {n}");
    }
}

#[test]
fn explicit_single_rejects_long_vectors() {
    let device = Arc::new(HostDevice::new());
    let (engine, _dir) = engine(&device);
    let src = device.upload(&HostData::F32(values(300))).expect("upload");
    let dst = device.allocate(1, DType::F32).expect("alloc");
    let err = engine
        .reduce_vector(Inject::Sum, Some(Topology::Single), &src, &dst, &[])
        .unwrap_err();
    assert!(matches!(err, ReduceError::InvalidShape { .. }), "{err}");
    assert_eq!(device.pending(), 0);
}

#[test]
fn empty_vector_is_rejected() {
    let device = Arc::new(HostDevice::new());
    let (engine, _dir) = engine(&device);
    let src = device.allocate(0, DType::F32).expect("alloc");
    let dst = device.allocate(1, DType::F32).expect("alloc");
    let err = engine.sum(&src, &dst, &[]).unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn segmented_temporaries_are_released() {
    let device = Arc::new(HostDevice::new());
    let (engine, _dir) = engine(&device);
    let src = device
        .upload(&HostData::F32(values(10_000)))
        .expect("upload");
    let dst = device.allocate(1, DType::F32).expect("alloc");
    let live = device.live_buffers();
    let ev = engine.sum(&src, &dst, &[]).expect("sum");
    device.wait(&[ev]).expect("wait");
    assert_eq!(device.live_buffers(), live);
    assert!(engine.telemetry().snapshot().temporaries > 0);
}

/// Topologies that can legally reduce `n` elements with groups of `wg` lanes.
fn topologies_for(n: usize, wg: u32) -> Vec<Topology> {
    let mut all = vec![Topology::Segmented, Topology::TwoPhaseLarge];
    if n <= wg as usize {
        all.insert(0, Topology::Single);
    }
    all
}

fn reduce_f32(
    device: &HostDevice,
    engine: &ReductionEngine,
    inject: Inject,
    topology: Topology,
    src: &runmat_reduce::BufferHandle,
) -> HostData {
    let dtype = if inject == Inject::ArgMax || inject == Inject::ArgMin {
        DType::U32
    } else {
        DType::F32
    };
    let dst = device.allocate(1, dtype).expect("alloc");
    engine
        .reduce_vector(inject, Some(topology), src, &dst, &[])
        .expect("reduce");
    device.read(&dst).expect("read")
}

#[test]
fn every_topology_matches_a_sequential_fold() {
    let device = Arc::new(HostDevice::new().with_max_workgroup(32));
    let (engine, _dir) = engine(&device);
    let wg = engine.workgroup();
    assert_eq!(wg, 32);
    let sizes = [1, wg - 1, wg, wg + 1, 2 * wg + 1, wg * wg + 5, 5_000];
    for n in sizes.map(|n| n as usize) {
        let data = values(n);
        let sum: f32 = data.iter().sum();
        let max = data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let min = data.iter().copied().fold(f32::INFINITY, f32::min);
        let src = device.upload(&HostData::F32(data.clone())).expect("upload");
        for topology in topologies_for(n, wg) {
            let at = format!("n = {n}, {topology:?}");
            let got = reduce_f32(&device, &engine, Inject::Sum, topology, &src);
            // integer-valued inputs keep every partial sum exact
            assert_eq!(got, HostData::F32(vec![sum]), "sum {at}");
            let got = reduce_f32(&device, &engine, Inject::Max, topology, &src);
            assert_eq!(got, HostData::F32(vec![max]), "max {at}");
            let got = reduce_f32(&device, &engine, Inject::Min, topology, &src);
            assert_eq!(got, HostData::F32(vec![min]), "min {at}");
            let got = reduce_f32(&device, &engine, Inject::ArgMax, topology, &src);
            assert_eq!(got, HostData::U32(vec![first_max(&data)]), "argmax {at}");
            let got = reduce_f32(&device, &engine, Inject::ArgMin, topology, &src);
            assert_eq!(got, HostData::U32(vec![first_min(&data)]), "argmin {at}");
        }
    }
}

#[test]
fn single_nan_wins_at_every_position() {
    let device = Arc::new(HostDevice::new().with_max_workgroup(32));
    let (engine, _dir) = engine(&device);
    let wg = engine.workgroup() as usize;
    for n in [1, wg - 1, wg, wg + 1, 2 * wg + 1, wg * wg + 76] {
        let mut positions: Vec<usize> = if n <= 2 * wg + 1 {
            (0..n).collect()
        } else {
            (0..n).step_by(37).collect()
        };
        positions.push(n - 1);
        for at in positions {
            let mut data = values(n);
            data[at] = f32::NAN;
            let src = device.upload(&HostData::F32(data)).expect("upload");
            for topology in topologies_for(n, wg as u32) {
                let case = format!("n = {n}, nan at {at}, {topology:?}");
                for inject in [Inject::Max, Inject::Min] {
                    let got = reduce_f32(&device, &engine, inject, topology, &src);
                    assert!(got.as_f32().expect("f32")[0].is_nan(), "{inject:?} {case}");
                }
                for inject in [Inject::ArgMax, Inject::ArgMin] {
                    let got = reduce_f32(&device, &engine, inject, topology, &src);
                    assert_eq!(got, HostData::U32(vec![at as u32]), "{inject:?} {case}");
                }
            }
        }
    }
}
