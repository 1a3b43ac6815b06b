//! WGSL lowering of the kernel IR.
//!
//! Integer division only ever appears as `x / params.f` or `x % params.f`, emitted by
//! [`split_flat`] for [`IndexMath::Divide`] and by the division probe.

use super::inject::Inject;
use super::ir::{
    Access, BindingSlot, BroadcastIr, BroadcastOp, IndexMath, KernelIr, LaneLoad, ReduceIr,
    ReduceStage, ScatterIr, ScatterMode,
};
use crate::dtype::{DType, Scalar};

const INDEX_SENTINEL: &str = "0xffffffffu";

const PARAMS_STRUCT: &str = "struct Params {
    len: u32,
    inner: u32,
    outer: u32,
    segments: u32,
    total: u32,
    grid_x: u32,
    shift: u32,
    shift_outer: u32,
    classes: u32,
    x_base: u32,
    y_base: u32,
    z_base: u32,
};
";

const ENTRY_ARGS: &str =
    "@builtin(local_invocation_id) lid3: vec3<u32>, @builtin(workgroup_id) wid: vec3<u32>";

/// Float add through a compare-exchange loop on the bit pattern.
const F32_ATOMIC_ADD: &str = "fn acc_add(p: u32, v: f32) {
    var old = atomicLoad(&acc[p]);
    loop {
        let next = bitcast<u32>(bitcast<f32>(old) + v);
        let r = atomicCompareExchangeWeak(&acc[p], old, next);
        if (r.exchanged) { break; }
        old = r.old_value;
    }
}

";

const NAN_BITS: &str = "(b & 0x7f800000u) == 0x7f800000u && (b & 0x007fffffu) != 0u";

pub fn emit(ir: &KernelIr) -> String {
    let mut out = String::new();
    out.push_str(&header(ir));
    out.push_str(&bindings(&ir.bindings()));
    match ir {
        KernelIr::Reduce(r) => out.push_str(&reduce_body(r)),
        KernelIr::Scatter(s) => out.push_str(&scatter_body(s)),
        KernelIr::Broadcast(b) => out.push_str(&broadcast_body(b)),
        KernelIr::DivProbe { workgroup } => out.push_str(&div_probe_body(*workgroup)),
    }
    out
}

fn header(ir: &KernelIr) -> String {
    format!("// {}\n{}\n", ir.name(), PARAMS_STRUCT)
}

fn entry(wg: u32) -> String {
    format!("@compute @workgroup_size({wg})\nfn main({ENTRY_ARGS}) {{\n")
}

fn storage_type(slot: &BindingSlot) -> String {
    match slot.access {
        Access::Atomic => match slot.dtype {
            DType::I32 => "array<atomic<i32>>".to_string(),
            _ => "array<atomic<u32>>".to_string(),
        },
        _ => format!("array<{}>", slot.dtype.wgsl()),
    }
}

fn bindings(slots: &[BindingSlot]) -> String {
    let mut out = String::new();
    for (binding, slot) in slots.iter().enumerate() {
        let access = match slot.access {
            Access::Read => "read",
            Access::ReadWrite | Access::Atomic => "read_write",
        };
        out.push_str(&format!(
            "@group(0) @binding({binding}) var<storage, {access}> {}: {};\n",
            slot.name,
            storage_type(slot)
        ));
    }
    out.push_str(&format!(
        "@group(0) @binding({}) var<uniform> params: Params;\n\n",
        slots.len()
    ));
    out
}

/// WGSL spelling of a constant. Infinities are built from bit patterns since WGSL
/// has no infinite literals.
pub fn literal(value: Scalar) -> String {
    match value {
        Scalar::F32(v) if v == f32::INFINITY => "bitcast<f32>(0x7f800000u)".to_string(),
        Scalar::F32(v) if v == f32::NEG_INFINITY => "bitcast<f32>(0xff800000u)".to_string(),
        Scalar::F32(v) => format!("f32({v:?})"),
        Scalar::F64(v) if v == f64::INFINITY => "f64(bitcast<f32>(0x7f800000u))".to_string(),
        Scalar::F64(v) if v == f64::NEG_INFINITY => "f64(bitcast<f32>(0xff800000u))".to_string(),
        Scalar::F64(v) => format!("f64({v:?})"),
        Scalar::I32(v) => format!("i32({v})"),
        Scalar::U32(v) => format!("{v}u"),
    }
}

fn identity(inject: Inject, dtype: DType) -> String {
    inject
        .identity_scalar(dtype)
        .map(literal)
        .unwrap_or_else(|| "0u".to_string())
}

fn zero(dtype: DType) -> String {
    identity(Inject::Sum, dtype)
}

/// NaN test on the bit pattern; `x != x` may be folded away under finite-math rules.
/// f64 values are narrowed first, which keeps NaN a NaN.
fn nan_helper(dtype: DType) -> String {
    let bits = match dtype {
        DType::F32 => "bitcast<u32>(x)",
        DType::F64 => "bitcast<u32>(f32(x))",
        _ => {
            let ty = dtype.wgsl();
            return format!("fn is_nan(x: {ty}) -> bool {{ return false; }}\n");
        }
    };
    format!(
        "fn is_nan(x: {ty}) -> bool {{
    let b = {bits};
    return {NAN_BITS};
}}
",
        ty = dtype.wgsl()
    )
}

fn combine_helper(inject: Inject, dtype: DType) -> String {
    let ty = dtype.wgsl();
    let body = match inject {
        Inject::Sum => "    return a + b;".to_string(),
        Inject::Max | Inject::ArgMax => dominant("b > a"),
        Inject::Min | Inject::ArgMin => dominant("b < a"),
    };
    format!("fn combine(a: {ty}, b: {ty}) -> {ty} {{\n{body}\n}}\n")
}

fn dominant(takes_b: &str) -> String {
    format!(
        "    if (is_nan(a)) {{ return a; }}
    if (is_nan(b) || {takes_b}) {{ return b; }}
    return a;"
    )
}

fn take_rhs_helper(inject: Inject, dtype: DType) -> String {
    let ty = dtype.wgsl();
    let cmp = if inject.is_max() { ">" } else { "<" };
    format!(
        "fn take_rhs(av: {ty}, ai: u32, bv: {ty}, bi: u32) -> bool {{
    if (is_nan(av)) {{ return is_nan(bv) && bi < ai; }}
    if (is_nan(bv)) {{ return true; }}
    return (bv {cmp} av) || (bv == av && bi < ai);
}}
"
    )
}

fn reduce_helpers(r: &ReduceIr) -> String {
    let mut out = nan_helper(r.dtype);
    if r.inject.indexed() {
        out.push_str(&take_rhs_helper(r.inject, r.dtype));
    } else {
        out.push_str(&combine_helper(r.inject, r.dtype));
    }
    out.push('\n');
    out
}

/// Fold `(v, vi)` into the running `(acc, acc_i)`.
fn fold(indexed: bool, v: &str, vi: &str) -> String {
    if indexed {
        format!("if (take_rhs(acc, acc_i, {v}, {vi})) {{ acc = {v}; acc_i = {vi}; }}")
    } else {
        format!("acc = combine(acc, {v});")
    }
}

/// Load element `j` of the current row into `(v, vi)` and fold it.
fn load_and_fold(r: &ReduceIr, j: &str) -> String {
    let index = if r.carry_index {
        "src_idx[p]".to_string()
    } else {
        j.to_string()
    };
    format!(
        "let p = (base + {j}) * params.inner + i; let v = src[p]; let vi = {index}; {}",
        fold(r.inject.indexed(), "v", "vi")
    )
}

fn accumulators(r: &ReduceIr) -> String {
    format!(
        "    var acc: {} = {};\n    var acc_i: u32 = {INDEX_SENTINEL};\n",
        r.dtype.wgsl(),
        identity(r.inject, r.dtype)
    )
}

fn store(r: &ReduceIr, out: &str, from_tile: bool) -> String {
    let (value, index) = if from_tile {
        ("tile_v[0u]", "tile_i[0u]")
    } else {
        ("acc", "acc_i")
    };
    let mut s = String::new();
    if r.write_values {
        s.push_str(&format!("dst[{out}] = {value}; "));
    }
    if r.writes_index() {
        s.push_str(&format!("dst_idx[{out}] = {index}; "));
    }
    s
}

/// Split a flat id into `(hi, lo)` coordinates around `params.{field}`.
fn split_flat(math: IndexMath, flat: &str, field: &str, shift: &str, hi: &str, lo: &str) -> String {
    match math {
        IndexMath::Divide => format!(
            "    let {hi} = {flat} / params.{field};
    let {lo} = {flat} % params.{field};
"
        ),
        IndexMath::Shift => format!(
            "    let {hi} = {flat} >> params.{shift};
    let {lo} = {flat} & (params.{field} - 1u);
"
        ),
        IndexMath::Grid => String::new(),
    }
}

/// Flat lane id over a 2-D grid of groups, plus the range guard.
fn flat_lane(wg: u32) -> String {
    format!(
        "    let e = ((wid.y + params.y_base) * params.grid_x + wid.x + params.x_base) * {wg}u + lid3.x;
    if (e >= params.total) {{ return; }}
"
    )
}

/// Halving tree over the work-group tile with a barrier after every step.
fn tree(fold_step: &str, wg: u32) -> String {
    format!(
        "    workgroupBarrier();
    var s: u32 = {half}u;
    loop {{
        if (s == 0u) {{ break; }}
        if (lid < s) {{
            {fold_step}
        }}
        workgroupBarrier();
        s = s >> 1u;
    }}
",
        half = wg / 2
    )
}

fn tree_fold(indexed: bool) -> &'static str {
    if indexed {
        "if (take_rhs(tile_v[lid], tile_i[lid], tile_v[lid + s], tile_i[lid + s])) {
                tile_v[lid] = tile_v[lid + s];
                tile_i[lid] = tile_i[lid + s];
            }"
    } else {
        "tile_v[lid] = combine(tile_v[lid], tile_v[lid + s]);"
    }
}

fn serial_reduce(r: &ReduceIr) -> String {
    let wg = r.workgroup;
    let mut out = entry(wg);
    match r.index_math {
        IndexMath::Grid => out.push_str(&format!(
            "    let i = (wid.x + params.x_base) * {wg}u + lid3.x;
    let o = wid.y + params.y_base;
    if (i >= params.inner || o >= params.outer) {{ return; }}
"
        )),
        math => {
            out.push_str(&flat_lane(wg));
            out.push_str(&split_flat(math, "e", "inner", "shift", "o", "i"));
        }
    }
    out.push_str(&format!(
        "    let row = o * params.inner + i;
    let base = o * params.len;
{acc}    var j: u32 = 0u;
    loop {{
        if (j >= params.len) {{ break; }}
        {step}
        j = j + 1u;
    }}
    {store}
}}
",
        acc = accumulators(r),
        step = load_and_fold(r, "j"),
        store = store(r, "row", false)
    ));
    out
}

fn reduce_body(r: &ReduceIr) -> String {
    let wg = r.workgroup;
    let mut out = reduce_helpers(r);
    if let ReduceStage::Serial = r.stage {
        out.push_str(&serial_reduce(r));
        return out;
    }

    out.push_str(&format!(
        "var<workgroup> tile_v: array<{ty}, {wg}>;
var<workgroup> tile_i: array<u32, {wg}>;

",
        ty = r.dtype.wgsl()
    ));
    out.push_str(&entry(wg));
    out.push_str(
        "    let lid = lid3.x;
    let seg = wid.x + params.x_base;
    let i = wid.y + params.y_base;
    let o = wid.z + params.z_base;
    if (seg >= params.segments || i >= params.inner || o >= params.outer) { return; }
    let row = o * params.inner + i;
    let base = o * params.len;
",
    );
    out.push_str(&accumulators(r));
    let lane = match r.stage {
        ReduceStage::Tree(LaneLoad::One) => format!(
            "    let j0 = seg * {wg}u + lid;
    if (j0 < params.len) {{ {} }}
",
            load_and_fold(r, "j0")
        ),
        ReduceStage::Tree(LaneLoad::Two) => format!(
            "    let j0 = seg * {two}u + lid;
    if (j0 < params.len) {{ {} }}
    let j1 = j0 + {wg}u;
    if (j1 < params.len) {{ {} }}
",
            load_and_fold(r, "j0"),
            load_and_fold(r, "j1"),
            two = wg * 2
        ),
        ReduceStage::Tree(LaneLoad::Strided) => format!(
            "    var j = lid;
    loop {{
        if (j >= params.len) {{ break; }}
        {}
        j = j + {wg}u;
    }}
",
            load_and_fold(r, "j")
        ),
        ReduceStage::GridStride => format!(
            "    let step = params.segments * {wg}u;
    var j = seg * {wg}u + lid;
    loop {{
        if (j >= params.len) {{ break; }}
        {}
        j = j + step;
    }}
",
            load_and_fold(r, "j")
        ),
        ReduceStage::Serial => String::new(),
    };
    out.push_str(&lane);
    out.push_str("    tile_v[lid] = acc;\n    tile_i[lid] = acc_i;\n");
    out.push_str(&tree(tree_fold(r.inject.indexed()), wg));
    out.push_str(&format!(
        "    if (lid == 0u) {{
        let out = row * params.segments + seg;
        {}
    }}
}}
",
        store(r, "out", true)
    ));
    out
}

fn atomic_add_helper(dtype: DType) -> String {
    match dtype {
        DType::F32 => F32_ATOMIC_ADD.to_string(),
        _ => format!(
            "fn acc_add(p: u32, v: {}) {{ atomicAdd(&acc[p], v); }}\n\n",
            dtype.wgsl()
        ),
    }
}

fn bounds_check(mode: ScatterMode) -> &'static str {
    if mode.checked() {
        "    if (cls >= params.classes) { return; }\n"
    } else {
        ""
    }
}

/// Lane coordinates for scatter kernels: `(row, column)` names plus the range guard.
fn scatter_lane(s: &ScatterIr, row: &str, row_limit: &str) -> String {
    let wg = s.workgroup;
    match s.index_math {
        IndexMath::Grid => format!(
            "    let c = (wid.x + params.x_base) * {wg}u + lid3.x;
    let {row} = wid.y + params.y_base;
    if (c >= params.inner || {row} >= params.{row_limit}) {{ return; }}
"
        ),
        math => flat_lane(wg) + &split_flat(math, "e", "inner", "shift", row, "c"),
    }
}

fn scatter_body(s: &ScatterIr) -> String {
    let wg = s.workgroup;
    let ty = s.dtype.wgsl();
    let mut out = String::new();
    if s.mode.atomic() {
        out.push_str(&atomic_add_helper(s.dtype));
    }
    if s.mode == ScatterMode::ClassTree {
        out.push_str(&format!("var<workgroup> tile_v: array<{ty}, {wg}>;\n\n"));
    }
    out.push_str(&entry(wg));
    match s.mode {
        ScatterMode::AtomicElement | ScatterMode::AtomicUnchecked => {
            out.push_str(&scatter_lane(s, "i", "len"));
            out.push_str("    let cls = indices[i];\n");
            out.push_str(bounds_check(s.mode));
            out.push_str(
                "    acc_add(cls * params.inner + c, addend[i * params.inner + c]);\n}\n",
            );
        }
        ScatterMode::ClassSerial => {
            out.push_str(&scatter_lane(s, "cls", "classes"));
            out.push_str(
                "    let p = cls * params.inner + c;
    var total = acc[p];
    var i: u32 = 0u;
    loop {
        if (i >= params.len) { break; }
        if (indices[i] == cls) { total = total + addend[i * params.inner + c]; }
        i = i + 1u;
    }
    acc[p] = total;
}
",
            );
        }
        ScatterMode::ClassTree => {
            out.push_str(&format!(
                "    let lid = lid3.x;
    let c = wid.x + params.x_base;
    let cls = wid.y + params.y_base;
    if (c >= params.inner || cls >= params.classes) {{ return; }}
    var part: {ty} = {zero};
    var i = lid;
    loop {{
        if (i >= params.len) {{ break; }}
        if (indices[i] == cls) {{ part = part + addend[i * params.inner + c]; }}
        i = i + {wg}u;
    }}
    tile_v[lid] = part;
",
                zero = zero(s.dtype)
            ));
            out.push_str(&tree("tile_v[lid] = tile_v[lid] + tile_v[lid + s];", wg));
            out.push_str(
                "    if (lid == 0u) {
        let p = cls * params.inner + c;
        acc[p] = acc[p] + tile_v[0u];
    }
}
",
            );
        }
        ScatterMode::RowAtomic => {
            out.push_str(&format!(
                "    let i = wid.x + params.x_base;
    if (i >= params.len) {{ return; }}
    let cls = indices[i];
{check}    var c = lid3.x;
    loop {{
        if (c >= params.inner) {{ break; }}
        acc_add(cls * params.inner + c, addend[i * params.inner + c]);
        c = c + {wg}u;
    }}
}}
",
                check = bounds_check(s.mode)
            ));
        }
    }
    out
}

fn broadcast_body(b: &BroadcastIr) -> String {
    let wg = b.workgroup;
    let mut out = entry(wg);
    match b.index_math {
        IndexMath::Grid => out.push_str(&format!(
            "    let i = (wid.x + params.x_base) * {wg}u + lid3.x;
    let j = wid.y + params.y_base;
    let o = wid.z + params.z_base;
    if (i >= params.inner || j >= params.len || o >= params.outer) {{ return; }}
"
        )),
        math => {
            out.push_str(&flat_lane(wg));
            out.push_str(&split_flat(math, "e", "inner", "shift", "t", "i"));
            out.push_str(&split_flat(math, "t", "len", "shift_outer", "o", "j"));
        }
    }
    out.push_str("    let row = o * params.inner + i;\n");
    out.push_str("    let p = (o * params.len + j) * params.inner + i;\n");
    match b.op {
        BroadcastOp::ExpSub => out.push_str("    dst[p] = exp(src[p] - stat[row]);\n}\n"),
        BroadcastOp::Div => out.push_str("    dst[p] = dst[p] / stat[row];\n}\n"),
    }
    out
}

fn div_probe_body(wg: u32) -> String {
    format!(
        "{entry}    let e = wid.x * {wg}u + lid3.x;
    if (e >= params.len) {{ return; }}
    quotient[e] = dividend[e] / divisor[e];
    remainder[e] = dividend[e] % divisor[e];
}}
",
        entry = entry(wg)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::DeviceCaps;
    use crate::device::DeviceLimits;
    use crate::kernel::generate;

    #[test]
    fn infinities_are_spelled_without_literals() {
        assert_eq!(
            literal(Scalar::F32(f32::NEG_INFINITY)),
            "bitcast<f32>(0xff800000u)"
        );
        assert_eq!(
            literal(Scalar::F64(f64::NEG_INFINITY)),
            "f64(bitcast<f32>(0xff800000u))"
        );
        assert_eq!(literal(Scalar::U32(7)), "7u");
        assert_eq!(literal(Scalar::I32(i32::MIN)), "i32(-2147483648)");
    }

    #[test]
    fn tree_kernel_has_barrier_in_every_halving_step() {
        let ir = KernelIr::Reduce(ReduceIr::tree(Inject::Sum, DType::F32, LaneLoad::One, 64));
        let src = emit(&ir);
        assert!(src.contains("@workgroup_size(64)"));
        assert!(src.contains("var s: u32 = 32u;"));
        assert_eq!(src.matches("workgroupBarrier();").count(), 2);
        assert!(!src.contains("/ params."));
    }

    #[test]
    fn unchecked_scatter_omits_bounds_test() {
        let mk = |mode| {
            emit(&KernelIr::Scatter(ScatterIr {
                mode,
                dtype: DType::F32,
                workgroup: 64,
                index_math: IndexMath::Grid,
            }))
        };
        assert!(mk(ScatterMode::AtomicElement).contains("cls >= params.classes"));
        assert!(!mk(ScatterMode::AtomicUnchecked).contains("cls >= params.classes"));
        assert!(mk(ScatterMode::AtomicElement).contains("atomicCompareExchangeWeak"));
    }

    #[test]
    fn divide_math_emits_integer_division() {
        let ir = KernelIr::Reduce(ReduceIr::serial(Inject::Max, DType::I32, 64, IndexMath::Divide));
        assert!(emit(&ir).contains("e / params.inner"));
        let ir = KernelIr::Reduce(ReduceIr::serial(Inject::Max, DType::I32, 64, IndexMath::Shift));
        assert!(emit(&ir).contains("e >> params.shift"));
    }

    #[test]
    fn nan_test_reads_the_bit_pattern() {
        let helper = nan_helper(DType::F32);
        assert!(helper.contains("bitcast<u32>(x)"));
        assert!(!helper.contains("x != x"));
        assert!(nan_helper(DType::F64).contains("bitcast<u32>(f32(x))"));
        assert!(nan_helper(DType::I32).contains("return false;"));
    }

    fn caps(division_defect: bool) -> DeviceCaps {
        DeviceCaps {
            limits: DeviceLimits {
                name: "validator".into(),
                max_work_item_sizes: [256, 256, 64],
                max_invocations: 256,
                local_memory_bytes: 32 * 1024,
                max_workgroups_per_dim: 65_535,
                max_buffer_bytes: 1 << 30,
                supports_f64: true,
            },
            workgroup: 256,
            division_defect,
        }
    }

    /// Every IR shape the engine can ask for, across dtypes and index math.
    fn every_ir(wg: u32) -> Vec<KernelIr> {
        let dtypes = [DType::F32, DType::F64, DType::I32, DType::U32, DType::Bool];
        let maths = [IndexMath::Divide, IndexMath::Shift, IndexMath::Grid];
        let injects = [Inject::Sum, Inject::Max, Inject::Min, Inject::ArgMax, Inject::ArgMin];
        let mut irs = vec![KernelIr::DivProbe { workgroup: wg }];
        for dtype in dtypes {
            for inject in injects {
                let mut stages = vec![
                    ReduceIr::tree(inject, dtype, LaneLoad::One, wg),
                    ReduceIr::tree(inject, dtype, LaneLoad::Two, wg),
                    ReduceIr::tree(inject, dtype, LaneLoad::Strided, wg),
                    ReduceIr::grid_stride(inject, dtype, wg),
                ];
                stages.extend(maths.map(|m| ReduceIr::serial(inject, dtype, wg, m)));
                for ir in stages {
                    for (carry, last) in [(false, false), (true, false), (true, true)] {
                        irs.push(KernelIr::Reduce(ir.carrying(carry).finishing(last)));
                    }
                }
            }
            for mode in ScatterMode::ALL {
                for index_math in maths {
                    irs.push(KernelIr::Scatter(ScatterIr {
                        mode,
                        dtype,
                        workgroup: wg,
                        index_math,
                    }));
                }
            }
            for op in [BroadcastOp::ExpSub, BroadcastOp::Div] {
                for index_math in maths {
                    irs.push(KernelIr::Broadcast(BroadcastIr {
                        op,
                        dtype,
                        workgroup: wg,
                        index_math,
                    }));
                }
            }
        }
        irs
    }

    #[test]
    fn every_generated_kernel_passes_naga_validation() {
        let mut validated = 0;
        for defect in [false, true] {
            let caps = caps(defect);
            for ir in every_ir(64) {
                let Ok(source) = generate(&ir, &caps) else {
                    continue;
                };
                let module = naga::front::wgsl::parse_str(&source.wgsl).unwrap_or_else(|err| {
                    panic!("{}: {}", source.name, err.emit_to_string(&source.wgsl))
                });
                naga::valid::Validator::new(
                    naga::valid::ValidationFlags::all(),
                    naga::valid::Capabilities::all(),
                )
                .validate(&module)
                .unwrap_or_else(|err| panic!("{}: {err:?}\n{}", source.name, source.wgsl));
                validated += 1;
            }
        }
        assert!(validated > 300, "only {validated} kernels generated");
    }
}
