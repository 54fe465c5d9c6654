//! OSR exit: rebuilding wasm frames from native frames.
//!
//! For every native guest frame the engine finds the stackmap record of the
//! safepoint the frame is stopped at and materializes the frame's typed
//! locals and operand-stack values from registers and stack memory. The
//! compiler models wasm locals as stack-allocated objects, so a local's
//! location yields a *pointer* to the slot; operand-stack entries are plain
//! SSA values and their locations yield the value itself.

use anyhow::{anyhow, bail, ensure, Context, Result};
use log::debug;

use crate::arch::{RegSnapshot, FRAME_BASE_REG};
use crate::elf::WasmLocation;
use crate::stackmap::{Location, LocationKind, StackmapTable, StkMapRecord};
use crate::stacktrace::{NativeFrame, GUEST_FUNCTION_PREFIX};
use crate::value::{ValType, Value};

/// Largest tolerated distance between a frame's pc offset and the matched
/// record. Anything bigger means the stackmap does not describe the code we
/// are actually running.
const MAX_RECORD_GAP: u32 = 3;

/// A reconstructed wasm frame.
#[derive(Clone, Debug)]
pub struct WasmFrame {
    pub loc: WasmLocation,
    pub locals: Vec<Value>,
    pub stack: Vec<Value>,
}

/// Rebuild the wasm frames for `native_frames` (innermost first), returning
/// them in caller-first order.
pub fn osr_exit(
    regs: &RegSnapshot,
    native_frames: &[NativeFrame],
    table: &StackmapTable,
) -> Result<Vec<WasmFrame>> {
    let mut frames = Vec::with_capacity(native_frames.len());
    for native in native_frames.iter().rev() {
        let func_index: u32 = native.function_name[GUEST_FUNCTION_PREFIX.len()..]
            .parse()
            .with_context(|| format!("malformed guest symbol {:?}", native.function_name))?;
        let record = lookup_record(table, func_index, native)?;
        debug!(
            "matched stackmap record for {} + {:#x} -> {}",
            native.function_name,
            native.pc_offset,
            WasmLocation::from_patchpoint_id(record.patchpoint_id)
        );
        frames.push(materialize_frame(record, native, regs)?);
    }
    Ok(frames)
}

fn lookup_record<'a>(
    table: &'a StackmapTable,
    func_index: u32,
    native: &NativeFrame,
) -> Result<&'a StkMapRecord> {
    let pc_offset = u32::try_from(native.pc_offset)
        .map_err(|_| anyhow!("pc offset {:#x} out of range", native.pc_offset))?;
    let record = table.lookup(func_index, pc_offset).ok_or_else(|| {
        anyhow!(
            "no stackmap record for func_{func_index} at pc offset {pc_offset:#x} \
             ({} records known for the function)",
            table.records_for(func_index).len()
        )
    })?;
    let gap = record.instruction_offset - pc_offset;
    ensure!(
        gap <= MAX_RECORD_GAP,
        "stackmap record for func_{func_index} is {gap} bytes past pc offset {pc_offset:#x}; \
         stackmap and code disagree"
    );
    Ok(record)
}

fn materialize_frame(
    record: &StkMapRecord,
    native: &NativeFrame,
    regs: &RegSnapshot,
) -> Result<WasmFrame> {
    let locs = &record.locations;
    // The first location is a constant holding the local count; the rest
    // are (type, slot) pairs, locals first, then operand-stack entries.
    ensure!(!locs.is_empty(), "stackmap record has no locations");
    let num_locals = constant_value(&locs[0])? as usize;
    ensure!(
        (locs.len() - 1) % 2 == 0,
        "stackmap record has a dangling location"
    );
    let num_slots = (locs.len() - 1) / 2;
    ensure!(
        num_locals <= num_slots,
        "stackmap record claims {num_locals} locals but carries {num_slots} slots"
    );

    let mut locals = Vec::with_capacity(num_locals);
    let mut stack = Vec::with_capacity(num_slots - num_locals);
    for (i, pair) in locs[1..].chunks_exact(2).enumerate() {
        let ty = ValType::from_encoding(constant_value(&pair[0])? as i64)?;
        let is_local = i < num_locals;
        let value = materialize_value(&pair[1], is_local, native, regs, ty)?;
        if is_local {
            locals.push(value);
        } else {
            stack.push(value);
        }
    }

    Ok(WasmFrame {
        loc: WasmLocation::from_patchpoint_id(record.patchpoint_id),
        locals,
        stack,
    })
}

fn constant_value(loc: &Location) -> Result<i32> {
    ensure!(
        loc.kind == LocationKind::Constant,
        "expected a constant location, found {:?}",
        loc.kind
    );
    Ok(loc.offset)
}

fn reg_value(regs: &RegSnapshot, dwarf_regnum: u16) -> Result<u64> {
    regs.get(dwarf_regnum).ok_or_else(|| {
        anyhow!("register {dwarf_regnum} is not part of the callee-saved snapshot")
    })
}

/// Base register contents for Direct/Indirect locations. The frame base
/// register is taken from the walked frame, everything else from the trap
/// snapshot.
fn location_base(loc: &Location, native: &NativeFrame, regs: &RegSnapshot) -> Result<u64> {
    if loc.dwarf_regnum == FRAME_BASE_REG {
        Ok(native.fp)
    } else {
        reg_value(regs, loc.dwarf_regnum)
    }
}

fn materialize_value(
    loc: &Location,
    is_local: bool,
    native: &NativeFrame,
    regs: &RegSnapshot,
    ty: ValType,
) -> Result<Value> {
    match loc.kind {
        LocationKind::Register => {
            let bits = reg_value(regs, loc.dwarf_regnum)?;
            if is_local {
                // The register holds the address of the local's slot.
                Ok(unsafe { read_value(bits, ty) })
            } else {
                Ok(value_from_bits(bits, ty))
            }
        }
        LocationKind::Direct => {
            let addr = location_base(loc, native, regs)?.wrapping_add_signed(loc.offset as i64);
            if is_local {
                Ok(unsafe { read_value(addr, ty) })
            } else {
                Ok(value_from_bits(addr, ty))
            }
        }
        LocationKind::Indirect => {
            let addr = location_base(loc, native, regs)?.wrapping_add_signed(loc.offset as i64);
            if is_local {
                // The spilled word is the slot address, not the value.
                let slot = unsafe { (addr as *const u64).read_unaligned() };
                Ok(unsafe { read_value(slot, ty) })
            } else {
                Ok(unsafe { read_value(addr, ty) })
            }
        }
        LocationKind::Constant | LocationKind::ConstantIndex => {
            bail!("constant location is not valid for a live slot")
        }
    }
}

/// Read a typed value out of guest stack memory.
unsafe fn read_value(addr: u64, ty: ValType) -> Value {
    match ty {
        ValType::I32 => Value::I32((addr as *const i32).read_unaligned()),
        ValType::I64 => Value::I64((addr as *const i64).read_unaligned()),
        ValType::F32 => Value::F32((addr as *const f32).read_unaligned()),
        ValType::F64 => Value::F64((addr as *const f64).read_unaligned()),
    }
}

/// Reinterpret raw register bits as a typed value.
fn value_from_bits(bits: u64, ty: ValType) -> Value {
    match ty {
        ValType::I32 => Value::I32(bits as u32 as i32),
        ValType::I64 => Value::I64(bits as i64),
        ValType::F32 => Value::F32(f32::from_bits(bits as u32)),
        ValType::F64 => Value::F64(f64::from_bits(bits)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stackmap::{Stackmap, StkMapRecord};

    fn constant(value: i32) -> Location {
        Location {
            kind: LocationKind::Constant,
            size: 8,
            dwarf_regnum: 0,
            offset: value,
        }
    }

    fn loc(kind: LocationKind, dwarf_regnum: u16, offset: i32) -> Location {
        Location {
            kind,
            size: 8,
            dwarf_regnum,
            offset,
        }
    }

    fn table(records: Vec<StkMapRecord>) -> StackmapTable {
        StackmapTable::build(Stackmap {
            version: 3,
            stk_size_records: Vec::new(),
            constants: Vec::new(),
            records,
        })
    }

    fn record(func: u32, insn: u32, insn_offset: u32, locations: Vec<Location>) -> StkMapRecord {
        StkMapRecord {
            patchpoint_id: (func as u64) << 32 | insn as u64,
            instruction_offset: insn_offset,
            flags: 0,
            locations,
            live_outs: Vec::new(),
        }
    }

    fn frame(func: u32, pc_offset: u64, fp: u64) -> NativeFrame {
        NativeFrame {
            function_name: format!("func_{func}"),
            pc: 0x1000 + pc_offset,
            pc_offset,
            sp: fp,
            fp,
        }
    }

    /// Place a value in the arch's first pinnable callee-saved register and
    /// return its DWARF number.
    fn pin_reg(regs: &mut RegSnapshot, bits: u64) -> u16 {
        cfg_if::cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                regs.rbx = bits;
                3
            } else {
                regs.x19 = bits;
                19
            }
        }
    }

    #[test]
    fn materializes_locals_and_stack_from_a_fake_frame() {
        // A fabricated native frame: 24 bytes of "stack" below fp holding an
        // i32 local slot at fp-16 and a spilled i64 operand at fp-8.
        let mut buf = [0u8; 24];
        let fp = buf.as_mut_ptr() as u64 + 24;
        buf[8..12].copy_from_slice(&42i32.to_le_bytes());
        buf[16..24].copy_from_slice(&0x1122_3344_5566_7788u64.to_le_bytes());

        let locations = vec![
            constant(1),
            constant(0), // i32 local, alloca at fp-16
            loc(LocationKind::Direct, FRAME_BASE_REG, -16),
            constant(1), // i64 stack entry spilled at fp-8
            loc(LocationKind::Indirect, FRAME_BASE_REG, -8),
        ];
        let table = table(vec![record(5, 9, 0x24, locations)]);
        let native = [frame(5, 0x22, fp)];

        let trace = osr_exit(&RegSnapshot::default(), &native, &table).unwrap();
        assert_eq!(trace.len(), 1);
        assert_eq!(trace[0].loc.function, 5);
        assert_eq!(trace[0].loc.insn_offset, 9);
        assert_eq!(trace[0].locals, vec![Value::I32(42)]);
        assert_eq!(trace[0].stack, vec![Value::I64(0x1122_3344_5566_7788)]);
    }

    #[test]
    fn register_locations_deref_for_locals_only() {
        let slot = 7.5f64;
        let mut regs = RegSnapshot::default();
        let regnum = pin_reg(&mut regs, &slot as *const f64 as u64);

        // As a local the register is a pointer to the slot.
        let locations = vec![constant(1), constant(3), loc(LocationKind::Register, regnum, 0)];
        let tbl = table(vec![record(0, 0, 0, locations)]);
        let trace = osr_exit(&regs, &[frame(0, 0, 0)], &tbl).unwrap();
        assert_eq!(trace[0].locals, vec![Value::F64(7.5)]);

        // As a stack entry the register bits are the value itself.
        let mut regs = RegSnapshot::default();
        let regnum = pin_reg(&mut regs, 0xdead_beef);
        let locations = vec![constant(0), constant(1), loc(LocationKind::Register, regnum, 0)];
        let tbl = table(vec![record(0, 0, 0, locations)]);
        let trace = osr_exit(&regs, &[frame(0, 0, 0)], &tbl).unwrap();
        assert_eq!(trace[0].stack, vec![Value::I64(0xdead_beef)]);
    }

    #[test]
    fn frames_come_out_caller_first() {
        let locations = || vec![constant(0)];
        let table = table(vec![
            record(1, 0, 0x10, locations()),
            record(2, 0, 0x20, locations()),
        ]);
        // Innermost-first input: func_2 called by func_1.
        let native = [frame(2, 0x20, 0), frame(1, 0x10, 0)];
        let trace = osr_exit(&RegSnapshot::default(), &native, &table).unwrap();
        assert_eq!(trace[0].loc.function, 1);
        assert_eq!(trace[1].loc.function, 2);
    }

    #[test]
    fn missing_or_distant_records_are_fatal() {
        let table = table(vec![record(1, 0, 0x10, vec![constant(0)])]);

        // No record at or past the offset.
        let err = osr_exit(&RegSnapshot::default(), &[frame(1, 0x11, 0)], &table).unwrap_err();
        assert!(err.to_string().contains("no stackmap record"), "{err}");

        // A record exists but lies more than three bytes ahead.
        let err = osr_exit(&RegSnapshot::default(), &[frame(1, 0x0c, 0)], &table).unwrap_err();
        assert!(err.to_string().contains("stackmap and code disagree"), "{err}");

        // Unknown function.
        assert!(osr_exit(&RegSnapshot::default(), &[frame(9, 0, 0)], &table).is_err());
    }
}
