//! Lane-by-lane interpreter for the kernel IR.
//!
//! Each group is run to completion before the next; inside a group every halving
//! step of the tree finishes for all lanes before the next step starts, which is
//! what the barrier guarantees on a device.

use std::collections::HashMap;

use crate::device::{BufferHandle, KernelParams, Launch};
use crate::dtype::{DType, Element, FloatElement, HostData};
use crate::error::{ReduceError, Result};
use crate::kernel::{
    BroadcastIr, BroadcastOp, IndexMath, Inject, KernelIr, LaneLoad, ReduceIr, ReduceStage,
    ScatterIr, ScatterMode,
};

const SENTINEL: u32 = u32::MAX;

pub(super) struct Exec<'a> {
    pub buffers: &'a mut HashMap<u64, HostData>,
    pub name: &'a str,
    /// Model a device whose integer division goes through single precision.
    pub division_defect: bool,
}

impl<'a> Exec<'a> {
    pub fn run(&mut self, ir: &KernelIr, launch: &Launch) -> Result<()> {
        match ir {
            KernelIr::Reduce(r) => match r.dtype {
                DType::F32 => self.reduce::<f32>(r, launch),
                DType::F64 => self.reduce::<f64>(r, launch),
                DType::I32 => self.reduce::<i32>(r, launch),
                DType::U32 => self.reduce::<u32>(r, launch),
                DType::Bool => Err(self.fault("bool reduction has no template")),
            },
            KernelIr::Scatter(s) => match s.dtype {
                DType::F32 => self.scatter::<f32>(s, launch),
                DType::F64 => self.scatter::<f64>(s, launch),
                DType::I32 => self.scatter::<i32>(s, launch),
                DType::U32 => self.scatter::<u32>(s, launch),
                DType::Bool => Err(self.fault("bool scatter has no template")),
            },
            KernelIr::Broadcast(b) => match b.dtype {
                DType::F32 => self.broadcast::<f32>(b, launch),
                DType::F64 => self.broadcast::<f64>(b, launch),
                other => Err(self.fault(&format!("broadcast over {other}"))),
            },
            KernelIr::DivProbe { workgroup } => self.div_probe(*workgroup, launch),
        }
    }

    fn fault(&self, what: &str) -> ReduceError {
        ReduceError::device(format!("kernel '{}': {what}", self.name))
    }

    fn take<T: Element>(&mut self, handle: &BufferHandle) -> Result<Vec<T>> {
        let mut data = self
            .buffers
            .remove(&handle.id)
            .ok_or_else(|| ReduceError::device(format!("buffer {} is not live", handle.id)))?;
        if let Some(values) = T::slice_mut(&mut data) {
            return Ok(std::mem::take(values));
        }
        let got = data.dtype();
        self.buffers.insert(handle.id, data);
        Err(self.fault(&format!("output buffer is {got}, expected {}", T::DTYPE)))
    }

    fn put<T: Element>(&mut self, handle: &BufferHandle, values: Vec<T>) {
        self.buffers.insert(handle.id, T::wrap(values));
    }

    fn reduce<T: Element>(&mut self, r: &ReduceIr, launch: &Launch) -> Result<()> {
        let mut slots = launch.buffers.iter();
        let mut next = || {
            slots
                .next()
                .copied()
                .ok_or_else(|| ReduceError::device("missing buffer binding"))
        };
        let src_h = next()?;
        let src_idx_h = if r.carry_index { Some(next()?) } else { None };
        let dst_h = if r.write_values { Some(next()?) } else { None };
        let dst_idx_h = if r.writes_index() { Some(next()?) } else { None };

        let mut dst: Option<Vec<T>> = dst_h.as_ref().map(|h| self.take(h)).transpose()?;
        let mut dst_idx: Option<Vec<u32>> = match dst_idx_h.as_ref().map(|h| self.take(h)) {
            Some(Ok(v)) => Some(v),
            Some(Err(e)) => {
                if let (Some(h), Some(v)) = (&dst_h, dst.take()) {
                    self.put(h, v);
                }
                return Err(e);
            }
            None => None,
        };
        let buffers = &*self.buffers;
        let defect = self.division_defect;
        let result = (|| -> ExecResult {
            let src = view::<T>(buffers, &src_h)?;
            let src_idx = match &src_idx_h {
                Some(h) => Some(view::<u32>(buffers, h)?),
                None => None,
            };
            let mut out = Outputs {
                values: dst.as_deref_mut(),
                indices: dst_idx.as_deref_mut(),
            };
            let ctx = ReduceCtx {
                ir: r,
                p: &launch.params,
                src,
                src_idx,
                defect,
            };
            ctx.run(launch.grid, &mut out)
        })();
        if let (Some(h), Some(v)) = (&dst_h, dst) {
            self.put(h, v);
        }
        if let (Some(h), Some(v)) = (&dst_idx_h, dst_idx) {
            self.put(h, v);
        }
        result.map_err(|e| self.fault(&e))
    }

    fn scatter<T: Element>(&mut self, s: &ScatterIr, launch: &Launch) -> Result<()> {
        let [indices_h, addend_h, acc_h] = match launch.buffers.as_slice() {
            [a, b, c] => [*a, *b, *c],
            _ => return Err(self.fault("scatter expects three buffers")),
        };
        let mut acc = self.take::<T>(&acc_h)?;
        let buffers = &*self.buffers;
        let defect = self.division_defect;
        let result = (|| -> ExecResult {
            let ctx = ScatterCtx {
                ir: s,
                p: &launch.params,
                indices: view::<u32>(buffers, &indices_h)?,
                addend: view::<T>(buffers, &addend_h)?,
                defect,
            };
            ctx.run(launch.grid, &mut acc)
        })();
        self.put(&acc_h, acc);
        result.map_err(|e| self.fault(&e))
    }

    fn broadcast<T: FloatElement>(&mut self, b: &BroadcastIr, launch: &Launch) -> Result<()> {
        let (src_h, stat_h, dst_h) = match (b.op, launch.buffers.as_slice()) {
            (BroadcastOp::ExpSub, [src, stat, dst]) => (Some(*src), *stat, *dst),
            (BroadcastOp::Div, [stat, dst]) => (None, *stat, *dst),
            _ => return Err(self.fault("broadcast binding count mismatch")),
        };
        let mut dst = self.take::<T>(&dst_h)?;
        let buffers = &*self.buffers;
        let defect = self.division_defect;
        let result = (|| -> ExecResult {
            let stat = view::<T>(buffers, &stat_h)?;
            let src = match &src_h {
                Some(h) => Some(view::<T>(buffers, h)?),
                None => None,
            };
            broadcast_run(b, &launch.params, launch.grid, src, stat, &mut dst, defect)
        })();
        self.put(&dst_h, dst);
        result.map_err(|e| self.fault(&e))
    }

    fn div_probe(&mut self, wg: u32, launch: &Launch) -> Result<()> {
        let [a_h, b_h, q_h, r_h] = match launch.buffers.as_slice() {
            [a, b, q, r] => [*a, *b, *q, *r],
            _ => return Err(self.fault("division probe expects four buffers")),
        };
        let mut q = self.take::<u32>(&q_h)?;
        let mut rem = match self.take::<u32>(&r_h) {
            Ok(v) => v,
            Err(e) => {
                self.put(&q_h, q);
                return Err(e);
            }
        };
        let buffers = &*self.buffers;
        let defect = self.division_defect;
        let result = (|| -> ExecResult {
            let a = view::<u32>(buffers, &a_h)?;
            let b = view::<u32>(buffers, &b_h)?;
            for_each_group(launch.grid, |wx, _, _| {
                for lid in 0..wg {
                    let e = (wx * wg + lid) as usize;
                    if e >= launch.params.len as usize {
                        continue;
                    }
                    let (quot, r) = udiv(at(a, e)?, at(b, e)?, defect);
                    *at_mut(&mut q, e)? = quot;
                    *at_mut(&mut rem, e)? = r;
                }
                Ok(())
            })
        })();
        self.put(&q_h, q);
        self.put(&r_h, rem);
        result.map_err(|e| self.fault(&e))
    }
}

type ExecResult = std::result::Result<(), String>;

fn view<'b, T: Element>(
    buffers: &'b HashMap<u64, HostData>,
    h: &BufferHandle,
) -> std::result::Result<&'b [T], String> {
    let data = buffers
        .get(&h.id)
        .ok_or_else(|| format!("buffer {} is not live", h.id))?;
    T::slice(data).ok_or_else(|| {
        format!(
            "buffer {} holds {}, kernel reads {}",
            h.id,
            data.dtype(),
            T::DTYPE
        )
    })
}

fn at<T: Copy>(data: &[T], pos: usize) -> std::result::Result<T, String> {
    data.get(pos)
        .copied()
        .ok_or_else(|| format!("out-of-bounds read at {pos} (len {})", data.len()))
}

fn at_mut<T>(data: &mut [T], pos: usize) -> std::result::Result<&mut T, String> {
    let len = data.len();
    data.get_mut(pos)
        .ok_or_else(|| format!("out-of-bounds write at {pos} (len {len})"))
}

fn for_each_group(grid: [u32; 3], mut f: impl FnMut(u32, u32, u32) -> ExecResult) -> ExecResult {
    for wz in 0..grid[2] {
        for wy in 0..grid[1] {
            for wx in 0..grid[0] {
                f(wx, wy, wz)?;
            }
        }
    }
    Ok(())
}

/// Integer division as the device computes it. Division by zero yields `(a, 0)`.
fn udiv(a: u32, b: u32, defect: bool) -> (u32, u32) {
    if b == 0 {
        return (a, 0);
    }
    if defect && !b.is_power_of_two() {
        let q = (a as f32 / b as f32) as u32;
        return (q, a.wrapping_sub(q.wrapping_mul(b)));
    }
    (a / b, a % b)
}

/// Split a flat id into `(hi, lo)` the way the kernel's index math does.
fn split(math: IndexMath, flat: u32, divisor: u32, shift: u32, defect: bool) -> (u32, u32) {
    match math {
        IndexMath::Shift => (flat >> shift, flat & divisor.wrapping_sub(1)),
        _ => udiv(flat, divisor, defect),
    }
}

fn flat_id(p: &KernelParams, wg: u32, wx: u32, wy: u32, lid: u32) -> u32 {
    ((wy + p.y_base) * p.grid_x + wx + p.x_base) * wg + lid
}

fn fold<T: Element>(inject: Inject, acc: &mut T, acc_i: &mut u32, v: T, vi: u32) {
    if inject.indexed() {
        if inject.take_rhs(*acc, *acc_i, v, vi) {
            *acc = v;
            *acc_i = vi;
        }
    } else {
        *acc = inject.combine(*acc, v);
    }
}

struct Outputs<'o, T> {
    values: Option<&'o mut [T]>,
    indices: Option<&'o mut [u32]>,
}

impl<T: Copy> Outputs<'_, T> {
    fn store(&mut self, pos: usize, v: T, vi: u32) -> ExecResult {
        if let Some(values) = self.values.as_deref_mut() {
            *at_mut(values, pos)? = v;
        }
        if let Some(indices) = self.indices.as_deref_mut() {
            *at_mut(indices, pos)? = vi;
        }
        Ok(())
    }
}

struct ReduceCtx<'c, T> {
    ir: &'c ReduceIr,
    p: &'c KernelParams,
    src: &'c [T],
    src_idx: Option<&'c [u32]>,
    defect: bool,
}

impl<T: Element> ReduceCtx<'_, T> {
    fn run(&self, grid: [u32; 3], out: &mut Outputs<'_, T>) -> ExecResult {
        match self.ir.stage {
            ReduceStage::Serial => for_each_group(grid, |wx, wy, _| self.serial_group(wx, wy, out)),
            _ => for_each_group(grid, |wx, wy, wz| self.tree_group(wx, wy, wz, out)),
        }
    }

    fn load(&self, base: u32, j: u32, i: u32) -> std::result::Result<(T, u32), String> {
        let pos = ((base + j) * self.p.inner + i) as usize;
        let v = at(self.src, pos)?;
        let vi = match self.src_idx {
            Some(idx) => at(idx, pos)?,
            None => j,
        };
        Ok((v, vi))
    }

    fn fold_at(&self, acc: &mut T, acc_i: &mut u32, base: u32, j: u32, i: u32) -> ExecResult {
        let (v, vi) = self.load(base, j, i)?;
        fold(self.ir.inject, acc, acc_i, v, vi);
        Ok(())
    }

    fn serial_group(&self, wx: u32, wy: u32, out: &mut Outputs<'_, T>) -> ExecResult {
        let p = self.p;
        let wg = self.ir.workgroup;
        for lid in 0..wg {
            let (o, i) = match self.ir.index_math {
                IndexMath::Grid => {
                    let i = (wx + p.x_base) * wg + lid;
                    let o = wy + p.y_base;
                    if i >= p.inner || o >= p.outer {
                        continue;
                    }
                    (o, i)
                }
                math => {
                    let e = flat_id(p, wg, wx, wy, lid);
                    if e >= p.total {
                        continue;
                    }
                    split(math, e, p.inner, p.shift, self.defect)
                }
            };
            let row = o * p.inner + i;
            let base = o * p.len;
            let mut acc: T = self.ir.inject.identity();
            let mut acc_i = SENTINEL;
            for j in 0..p.len {
                self.fold_at(&mut acc, &mut acc_i, base, j, i)?;
            }
            out.store(row as usize, acc, acc_i)?;
        }
        Ok(())
    }

    fn tree_group(&self, wx: u32, wy: u32, wz: u32, out: &mut Outputs<'_, T>) -> ExecResult {
        let p = self.p;
        let wg = self.ir.workgroup;
        let seg = wx + p.x_base;
        let i = wy + p.y_base;
        let o = wz + p.z_base;
        if seg >= p.segments || i >= p.inner || o >= p.outer {
            return Ok(());
        }
        let row = o * p.inner + i;
        let base = o * p.len;
        let identity: T = self.ir.inject.identity();
        let mut tile_v = vec![identity; wg as usize];
        let mut tile_i = vec![SENTINEL; wg as usize];

        for lid in 0..wg {
            let mut acc = identity;
            let mut acc_i = SENTINEL;
            match self.ir.stage {
                ReduceStage::Tree(LaneLoad::One) => {
                    let j0 = seg * wg + lid;
                    if j0 < p.len {
                        self.fold_at(&mut acc, &mut acc_i, base, j0, i)?;
                    }
                }
                ReduceStage::Tree(LaneLoad::Two) => {
                    let j0 = seg * 2 * wg + lid;
                    if j0 < p.len {
                        self.fold_at(&mut acc, &mut acc_i, base, j0, i)?;
                    }
                    let j1 = j0 + wg;
                    if j1 < p.len {
                        self.fold_at(&mut acc, &mut acc_i, base, j1, i)?;
                    }
                }
                ReduceStage::Tree(LaneLoad::Strided) => {
                    let mut j = lid;
                    while j < p.len {
                        self.fold_at(&mut acc, &mut acc_i, base, j, i)?;
                        j += wg;
                    }
                }
                ReduceStage::GridStride => {
                    let step = p.segments * wg;
                    let mut j = seg * wg + lid;
                    while j < p.len {
                        self.fold_at(&mut acc, &mut acc_i, base, j, i)?;
                        j += step;
                    }
                }
                ReduceStage::Serial => {}
            }
            tile_v[lid as usize] = acc;
            tile_i[lid as usize] = acc_i;
        }

        let mut s = (wg / 2) as usize;
        while s > 0 {
            for lid in 0..s {
                let (mut v, mut vi) = (tile_v[lid], tile_i[lid]);
                fold(
                    self.ir.inject,
                    &mut v,
                    &mut vi,
                    tile_v[lid + s],
                    tile_i[lid + s],
                );
                tile_v[lid] = v;
                tile_i[lid] = vi;
            }
            s >>= 1;
        }
        out.store((row * p.segments + seg) as usize, tile_v[0], tile_i[0])
    }
}

struct ScatterCtx<'c, T> {
    ir: &'c ScatterIr,
    p: &'c KernelParams,
    indices: &'c [u32],
    addend: &'c [T],
    defect: bool,
}

impl<T: Element> ScatterCtx<'_, T> {
    fn run(&self, grid: [u32; 3], acc: &mut [T]) -> ExecResult {
        let p = self.p;
        let wg = self.ir.workgroup;
        let k = p.inner;
        match self.ir.mode {
            ScatterMode::AtomicElement | ScatterMode::AtomicUnchecked => {
                for_each_group(grid, |wx, wy, _| {
                    for lid in 0..wg {
                        let Some((i, c)) = self.lane_coords(wx, wy, lid, p.len, p.total) else {
                            continue;
                        };
                        let cls = at(self.indices, i as usize)?;
                        if self.ir.mode.checked() && cls >= p.classes {
                            continue;
                        }
                        let v = at(self.addend, (i * k + c) as usize)?;
                        let slot = at_mut(acc, (cls * k + c) as usize)?;
                        *slot = slot.add(v);
                    }
                    Ok(())
                })
            }
            ScatterMode::ClassSerial => for_each_group(grid, |wx, wy, _| {
                for lid in 0..wg {
                    let Some((cls, c)) = self.lane_coords(wx, wy, lid, p.classes, p.total) else {
                        continue;
                    };
                    let pos = (cls * k + c) as usize;
                    let mut total = at(acc, pos)?;
                    for i in 0..p.len {
                        if at(self.indices, i as usize)? == cls {
                            total = total.add(at(self.addend, (i * k + c) as usize)?);
                        }
                    }
                    *at_mut(acc, pos)? = total;
                }
                Ok(())
            }),
            ScatterMode::ClassTree => for_each_group(grid, |wx, wy, _| {
                let c = wx + p.x_base;
                let cls = wy + p.y_base;
                if c >= k || cls >= p.classes {
                    return Ok(());
                }
                let mut tile = vec![T::zero(); wg as usize];
                for lid in 0..wg {
                    let mut part = T::zero();
                    let mut i = lid;
                    while i < p.len {
                        if at(self.indices, i as usize)? == cls {
                            part = part.add(at(self.addend, (i * k + c) as usize)?);
                        }
                        i += wg;
                    }
                    tile[lid as usize] = part;
                }
                let mut s = (wg / 2) as usize;
                while s > 0 {
                    for lid in 0..s {
                        tile[lid] = tile[lid].add(tile[lid + s]);
                    }
                    s >>= 1;
                }
                let slot = at_mut(acc, (cls * k + c) as usize)?;
                *slot = slot.add(tile[0]);
                Ok(())
            }),
            ScatterMode::RowAtomic => for_each_group(grid, |wx, _, _| {
                let i = wx + p.x_base;
                if i >= p.len {
                    return Ok(());
                }
                let cls = at(self.indices, i as usize)?;
                if cls >= p.classes {
                    return Ok(());
                }
                for lid in 0..wg {
                    let mut c = lid;
                    while c < k {
                        let v = at(self.addend, (i * k + c) as usize)?;
                        let slot = at_mut(acc, (cls * k + c) as usize)?;
                        *slot = slot.add(v);
                        c += wg;
                    }
                }
                Ok(())
            }),
        }
    }

    /// `(row, column)` of a lane for the element-per-lane modes, `None` when idle.
    fn lane_coords(&self, wx: u32, wy: u32, lid: u32, rows: u32, total: u32) -> Option<(u32, u32)> {
        let p = self.p;
        let wg = self.ir.workgroup;
        match self.ir.index_math {
            IndexMath::Grid => {
                let c = (wx + p.x_base) * wg + lid;
                let row = wy + p.y_base;
                (c < p.inner && row < rows).then_some((row, c))
            }
            math => {
                let e = flat_id(p, wg, wx, wy, lid);
                (e < total).then(|| split(math, e, p.inner, p.shift, self.defect))
            }
        }
    }
}

fn broadcast_run<T: FloatElement>(
    b: &BroadcastIr,
    p: &KernelParams,
    grid: [u32; 3],
    src: Option<&[T]>,
    stat: &[T],
    dst: &mut [T],
    defect: bool,
) -> ExecResult {
    let wg = b.workgroup;
    for_each_group(grid, |wx, wy, wz| {
        for lid in 0..wg {
            let (o, j, i) = match b.index_math {
                IndexMath::Grid => {
                    let i = (wx + p.x_base) * wg + lid;
                    let j = wy + p.y_base;
                    let o = wz + p.z_base;
                    if i >= p.inner || j >= p.len || o >= p.outer {
                        continue;
                    }
                    (o, j, i)
                }
                math => {
                    let e = flat_id(p, wg, wx, wy, lid);
                    if e >= p.total {
                        continue;
                    }
                    let (t, i) = split(math, e, p.inner, p.shift, defect);
                    let (o, j) = split(math, t, p.len, p.shift_outer, defect);
                    (o, j, i)
                }
            };
            let row = (o * p.inner + i) as usize;
            let pos = ((o * p.len + j) * p.inner + i) as usize;
            let s = at(stat, row)?;
            let value = match (b.op, src) {
                (BroadcastOp::ExpSub, Some(src)) => at(src, pos)?.sub(s).exp(),
                (BroadcastOp::Div, _) => at(dst, pos)?.div(s),
                (BroadcastOp::ExpSub, None) => return Err("exp-sub without a source".into()),
            };
            *at_mut(dst, pos)? = value;
        }
        Ok(())
    })
}
