//! Parser for the LLVM `.llvm_stackmaps` section (stackmap format v3).
//!
//! The compiler records one patchpoint per wasm instruction boundary; the
//! 64-bit patchpoint id encodes `(function_index << 32) | insn_offset`. The
//! locations of each record describe where the live wasm locals and operand
//! stack slots are in the native frame, which is everything OSR exit needs.

use anyhow::{bail, ensure, Result};

/// Value-location variants from the stackmap format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocationKind {
    /// Value (or pointer to a local slot) lives in a register.
    Register,
    /// Value is `reg + offset` itself.
    Direct,
    /// Value lives in memory at `[reg + offset]`.
    Indirect,
    /// Small constant stored in the offset field.
    Constant,
    /// Index into the large-constant pool.
    ConstantIndex,
}

impl LocationKind {
    fn decode(raw: u8) -> Result<LocationKind> {
        Ok(match raw {
            0x1 => LocationKind::Register,
            0x2 => LocationKind::Direct,
            0x3 => LocationKind::Indirect,
            0x4 => LocationKind::Constant,
            0x5 => LocationKind::ConstantIndex,
            other => bail!("invalid stackmap location kind {other:#x}"),
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Location {
    pub kind: LocationKind,
    pub size: u16,
    pub dwarf_regnum: u16,
    pub offset: i32,
}

#[derive(Clone, Copy, Debug)]
pub struct LiveOut {
    pub dwarf_regnum: u16,
    pub size: u8,
}

#[derive(Clone, Debug)]
pub struct StkMapRecord {
    pub patchpoint_id: u64,
    /// Offset of the record's instruction from the function's code start.
    pub instruction_offset: u32,
    pub flags: u16,
    pub locations: Vec<Location>,
    pub live_outs: Vec<LiveOut>,
}

impl StkMapRecord {
    /// Wasm function index from the high half of the patchpoint id.
    pub fn function_index(&self) -> u32 {
        (self.patchpoint_id >> 32) as u32
    }
}

#[derive(Clone, Copy, Debug)]
pub struct StkSizeRecord {
    pub function_address: u64,
    pub stack_size: u64,
    pub record_count: u64,
}

#[derive(Clone, Debug)]
pub struct Stackmap {
    pub version: u8,
    pub stk_size_records: Vec<StkSizeRecord>,
    pub constants: Vec<u64>,
    pub records: Vec<StkMapRecord>,
}

/// Little-endian cursor over the raw section bytes. Alignment padding is
/// computed relative to the section start, which the format requires to be
/// 8-byte aligned.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Reader<'a> {
        Reader { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(
            self.pos + n <= self.data.len(),
            "truncated stackmap section: need {n} bytes at offset {:#x}",
            self.pos
        );
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    /// Consume the 4-byte pad word that re-aligns the cursor to 8 bytes.
    /// The format only ever leaves the cursor 4 bytes off.
    fn align8(&mut self) -> Result<()> {
        if self.pos % 8 != 0 {
            ensure!(
                self.pos % 8 == 4,
                "misaligned stackmap record at offset {:#x}",
                self.pos
            );
            self.u32()?;
        }
        Ok(())
    }
}

fn parse_location(r: &mut Reader<'_>) -> Result<Location> {
    let kind = LocationKind::decode(r.u8()?)?;
    let _reserved = r.u8()?;
    let size = r.u16()?;
    let dwarf_regnum = r.u16()?;
    let _reserved2 = r.u16()?;
    let offset = r.i32()?;
    Ok(Location {
        kind,
        size,
        dwarf_regnum,
        offset,
    })
}

fn parse_record(r: &mut Reader<'_>) -> Result<StkMapRecord> {
    let patchpoint_id = r.u64()?;
    let instruction_offset = r.u32()?;
    let flags = r.u16()?;
    let num_locations = r.u16()?;

    let mut locations = Vec::with_capacity(num_locations as usize);
    for _ in 0..num_locations {
        locations.push(parse_location(r)?);
    }
    r.align8()?;

    let _padding = r.u16()?;
    let num_live_outs = r.u16()?;
    let mut live_outs = Vec::with_capacity(num_live_outs as usize);
    for _ in 0..num_live_outs {
        let dwarf_regnum = r.u16()?;
        let _reserved = r.u8()?;
        let size = r.u8()?;
        live_outs.push(LiveOut { dwarf_regnum, size });
    }
    r.align8()?;

    Ok(StkMapRecord {
        patchpoint_id,
        instruction_offset,
        flags,
        locations,
        live_outs,
    })
}

/// Parse a `.llvm_stackmaps` section.
pub fn parse(data: &[u8]) -> Result<Stackmap> {
    let mut r = Reader::new(data);

    let version = r.u8()?;
    ensure!(version == 3, "unsupported stackmap version {version}");
    let _reserved1 = r.u8()?;
    let _reserved2 = r.u16()?;

    let num_functions = r.u32()?;
    let num_constants = r.u32()?;
    let num_records = r.u32()?;

    let mut stk_size_records = Vec::with_capacity(num_functions as usize);
    for _ in 0..num_functions {
        stk_size_records.push(StkSizeRecord {
            function_address: r.u64()?,
            stack_size: r.u64()?,
            record_count: r.u64()?,
        });
    }

    let mut constants = Vec::with_capacity(num_constants as usize);
    for _ in 0..num_constants {
        constants.push(r.u64()?);
    }

    let mut records = Vec::with_capacity(num_records as usize);
    for _ in 0..num_records {
        records.push(parse_record(&mut r)?);
    }

    Ok(Stackmap {
        version,
        stk_size_records,
        constants,
        records,
    })
}

/// Records regrouped for OSR exit: per wasm function, sorted by instruction
/// offset so lookup is a lower bound search.
pub struct StackmapTable {
    groups: std::collections::HashMap<u32, Vec<StkMapRecord>>,
}

impl StackmapTable {
    pub fn build(stackmap: Stackmap) -> StackmapTable {
        let mut groups: std::collections::HashMap<u32, Vec<StkMapRecord>> =
            std::collections::HashMap::new();
        for record in stackmap.records {
            groups.entry(record.function_index()).or_default().push(record);
        }
        for group in groups.values_mut() {
            group.sort_by_key(|r| r.instruction_offset);
        }
        StackmapTable { groups }
    }

    /// Find the record for `func_index` whose `instruction_offset` is the
    /// smallest one at or past `pc_offset`.
    pub fn lookup(&self, func_index: u32, pc_offset: u32) -> Option<&StkMapRecord> {
        let group = self.groups.get(&func_index)?;
        let idx = group.partition_point(|r| r.instruction_offset < pc_offset);
        group.get(idx)
    }

    /// All records for a function, for diagnostics.
    pub fn records_for(&self, func_index: u32) -> &[StkMapRecord] {
        self.groups.get(&func_index).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SectionBuilder {
        bytes: Vec<u8>,
    }

    impl SectionBuilder {
        fn new(num_functions: u32, num_records: u32) -> SectionBuilder {
            let mut bytes = vec![3u8, 0, 0, 0];
            bytes.extend_from_slice(&num_functions.to_le_bytes());
            bytes.extend_from_slice(&0u32.to_le_bytes());
            bytes.extend_from_slice(&num_records.to_le_bytes());
            SectionBuilder { bytes }
        }

        fn function(mut self, addr: u64, stack_size: u64, count: u64) -> SectionBuilder {
            self.bytes.extend_from_slice(&addr.to_le_bytes());
            self.bytes.extend_from_slice(&stack_size.to_le_bytes());
            self.bytes.extend_from_slice(&count.to_le_bytes());
            self
        }

        fn record(mut self, id: u64, insn_offset: u32, locs: &[(u8, u16, i32)]) -> SectionBuilder {
            self.bytes.extend_from_slice(&id.to_le_bytes());
            self.bytes.extend_from_slice(&insn_offset.to_le_bytes());
            self.bytes.extend_from_slice(&0u16.to_le_bytes());
            self.bytes
                .extend_from_slice(&(locs.len() as u16).to_le_bytes());
            for &(kind, regnum, offset) in locs {
                self.bytes.push(kind);
                self.bytes.push(0);
                self.bytes.extend_from_slice(&8u16.to_le_bytes());
                self.bytes.extend_from_slice(&regnum.to_le_bytes());
                self.bytes.extend_from_slice(&0u16.to_le_bytes());
                self.bytes.extend_from_slice(&offset.to_le_bytes());
            }
            if self.bytes.len() % 8 != 0 {
                self.bytes.extend_from_slice(&0u32.to_le_bytes());
            }
            // padding + num_live_outs = 0
            self.bytes.extend_from_slice(&0u16.to_le_bytes());
            self.bytes.extend_from_slice(&0u16.to_le_bytes());
            if self.bytes.len() % 8 != 0 {
                self.bytes.extend_from_slice(&0u32.to_le_bytes());
            }
            self
        }
    }

    fn id(func: u32, insn: u32) -> u64 {
        (func as u64) << 32 | insn as u64
    }

    #[test]
    fn parses_records_with_both_padding_parities() {
        // One record with an odd location count (forces the mid-record pad
        // word) and one with an even count (no pad word).
        let section = SectionBuilder::new(1, 2)
            .function(0x1000, 64, 2)
            .record(id(7, 4), 0x10, &[(0x4, 0, 1), (0x4, 0, 0), (0x3, 6, -24)])
            .record(id(7, 9), 0x2c, &[(0x4, 0, 0), (0x4, 0, 0)])
            .bytes;

        let map = parse(&section).unwrap();
        assert_eq!(map.version, 3);
        assert_eq!(map.stk_size_records.len(), 1);
        assert_eq!(map.records.len(), 2);

        let rec = &map.records[0];
        assert_eq!(rec.function_index(), 7);
        assert_eq!(rec.instruction_offset, 0x10);
        assert_eq!(rec.locations.len(), 3);
        assert_eq!(rec.locations[0].kind, LocationKind::Constant);
        assert_eq!(rec.locations[0].offset, 1);
        assert_eq!(rec.locations[2].kind, LocationKind::Indirect);
        assert_eq!(rec.locations[2].dwarf_regnum, 6);
        assert_eq!(rec.locations[2].offset, -24);

        assert_eq!(map.records[1].locations.len(), 2);
    }

    #[test]
    fn rejects_truncation_and_bad_version() {
        let section = SectionBuilder::new(0, 1)
            .record(id(0, 0), 0, &[(0x4, 0, 0)])
            .bytes;
        assert!(parse(&section[..section.len() - 1]).is_err());

        let mut bad = section;
        bad[0] = 2;
        assert!(parse(&bad).is_err());
    }

    #[test]
    fn lookup_is_lower_bound_per_function() {
        let section = SectionBuilder::new(1, 3)
            .function(0x1000, 64, 3)
            .record(id(3, 0), 0x08, &[(0x4, 0, 0)])
            .record(id(3, 1), 0x20, &[(0x4, 0, 0)])
            .record(id(4, 0), 0x04, &[(0x4, 0, 0)])
            .bytes;
        let table = StackmapTable::build(parse(&section).unwrap());

        assert_eq!(table.lookup(3, 0x08).unwrap().instruction_offset, 0x08);
        assert_eq!(table.lookup(3, 0x09).unwrap().instruction_offset, 0x20);
        assert_eq!(table.lookup(3, 0x20).unwrap().instruction_offset, 0x20);
        assert!(table.lookup(3, 0x21).is_none());
        assert!(table.lookup(9, 0).is_none());
        assert_eq!(table.records_for(3).len(), 2);
    }
}
