//! Reader for the running executable's ELF image.
//!
//! Two side tables the AOT compiler leaves behind get pulled out of
//! `/proc/self/exe`: raw section contents (the stackmap section in
//! particular) and the DWARF line table of the synthetic compilation unit
//! whose producer string is `"wanco"`. The compiler abuses that line table
//! as a pc-to-wasm map: each row's `line` is a wasm function index and its
//! `column` is the instruction offset within the function.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::ops::Range;

use anyhow::{Context, Result};
use log::{debug, warn};
use object::{Object, ObjectSection, ObjectSymbol, SymbolKind};

/// Sentinel producer string of the compilation unit holding the wasm line
/// table.
const LINE_TABLE_PRODUCER: &str = "wanco";

/// A location in the guest program: function index plus instruction offset
/// from the function start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WasmLocation {
    pub function: u32,
    pub insn_offset: u32,
}

impl WasmLocation {
    /// Decode the 64-bit stackmap patchpoint id, `(function << 32) | insn`.
    pub fn from_patchpoint_id(id: u64) -> WasmLocation {
        WasmLocation {
            function: (id >> 32) as u32,
            insn_offset: id as u32,
        }
    }
}

impl fmt::Display for WasmLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "func_{} at op {}", self.function, self.insn_offset)
    }
}

struct FuncSymbol {
    address: u64,
    size: u64,
    name: String,
}

/// Parsed view of the running executable.
///
/// Construction reads and indexes everything; lookups afterwards are pure.
pub struct ElfImage {
    data: Vec<u8>,
    /// Section name to file range of its contents.
    sections: Vec<(String, Range<usize>)>,
    /// Function symbols sorted by address.
    symbols: Vec<FuncSymbol>,
    /// Line-table rows of the wanco unit, sorted by address.
    line_locations: Vec<(u64, WasmLocation)>,
    /// Difference between runtime and link-time addresses.
    load_bias: u64,
}

impl ElfImage {
    /// Open and index the running executable.
    pub fn open_self() -> Result<ElfImage> {
        ElfImage::open("/proc/self/exe")
    }

    /// Open and index the executable at `path`, which must be the image of
    /// the running process (the load bias is derived from the process aux
    /// vector).
    pub fn open(path: &str) -> Result<ElfImage> {
        let data = fs::read(path).with_context(|| format!("failed to read {path}"))?;
        let obj = object::File::parse(&*data)
            .with_context(|| format!("failed to parse {path} as an object file"))?;

        let mut sections = Vec::new();
        for section in obj.sections() {
            if let (Ok(name), Some((offset, size))) = (section.name(), section.file_range()) {
                sections.push((
                    name.to_string(),
                    offset as usize..(offset + size) as usize,
                ));
            }
        }

        let mut symbols: Vec<FuncSymbol> = obj
            .symbols()
            .filter(|sym| sym.kind() == SymbolKind::Text)
            .filter_map(|sym| {
                Some(FuncSymbol {
                    address: sym.address(),
                    size: sym.size(),
                    name: sym.name().ok()?.to_string(),
                })
            })
            .collect();
        symbols.sort_by_key(|s| s.address);

        let load_bias = runtime_load_bias(&data, &obj);
        let line_locations = read_wasm_line_table(&obj).unwrap_or_else(|err| {
            warn!("failed to read the wasm line table: {err:#}");
            Vec::new()
        });
        debug!(
            "indexed image: {} sections, {} function symbols, {} line rows, bias {load_bias:#x}",
            sections.len(),
            symbols.len(),
            line_locations.len()
        );

        Ok(ElfImage {
            data,
            sections,
            symbols,
            line_locations,
            load_bias,
        })
    }

    /// Contents of the named section, if present.
    pub fn section(&self, name: &str) -> Option<&[u8]> {
        self.sections
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, range)| &self.data[range.clone()])
    }

    /// Resolve a runtime pc to the containing function symbol, returning the
    /// name and the offset from the function start.
    pub fn resolve_symbol(&self, pc: u64) -> Option<(&str, u64)> {
        let addr = pc.checked_sub(self.load_bias)?;
        let idx = self
            .symbols
            .partition_point(|s| s.address <= addr)
            .checked_sub(1)?;
        let sym = &self.symbols[idx];
        if sym.size > 0 && addr >= sym.address + sym.size {
            return None;
        }
        Some((&sym.name, addr - sym.address))
    }

    /// The wasm location covering a runtime pc, together with the address of
    /// the covering line-table row.
    ///
    /// When `pc` was recovered as a return address from the stack walk it
    /// points one past the site of interest, so the lookup key is backed up
    /// by one byte first.
    pub fn wasm_location_at(&self, pc: u64, is_return_address: bool) -> Option<(u64, WasmLocation)> {
        let addr = pc
            .checked_sub(self.load_bias)?
            .checked_sub(is_return_address as u64)?;
        lookup_floor(&self.line_locations, addr)
    }
}

/// Greatest entry with an address at or below `addr`.
fn lookup_floor(rows: &[(u64, WasmLocation)], addr: u64) -> Option<(u64, WasmLocation)> {
    let idx = rows.partition_point(|(a, _)| *a <= addr).checked_sub(1)?;
    Some(rows[idx])
}

/// Runtime-minus-link-time address difference for the running image.
///
/// Position-independent executables link their segments near zero and get
/// relocated wholesale; the ELF header's runtime address can be recovered
/// from `AT_PHDR` in the aux vector. Fixed-position executables need no
/// adjustment.
fn runtime_load_bias(data: &[u8], obj: &object::File<'_>) -> u64 {
    const ET_EXEC: u16 = 2;
    // e_type and e_phoff from the raw 64-bit ELF header.
    let e_type = u16::from_le_bytes([data[0x10], data[0x11]]);
    if e_type == ET_EXEC || !matches!(obj, object::File::Elf64(_)) {
        return 0;
    }
    let e_phoff = u64::from_le_bytes(data[0x20..0x28].try_into().unwrap());
    let phdr = unsafe { libc::getauxval(libc::AT_PHDR) } as u64;
    phdr.wrapping_sub(e_phoff)
}

/// Collect `(address, wasm location)` rows from the line table of the
/// compilation unit produced by the AOT compiler.
fn read_wasm_line_table(obj: &object::File<'_>) -> Result<Vec<(u64, WasmLocation)>> {
    let endian = gimli::LittleEndian;
    let load_section = |id: gimli::SectionId| -> Result<Cow<'_, [u8]>, gimli::Error> {
        match obj.section_by_name(id.name()) {
            Some(section) => Ok(Cow::Borrowed(section.data().unwrap_or(&[]))),
            None => Ok(Cow::Borrowed(&[][..])),
        }
    };
    let dwarf_sections = gimli::Dwarf::load(load_section)?;
    let dwarf = dwarf_sections.borrow(|section| gimli::EndianSlice::new(section, endian));

    // First row seen for an address wins, matching the compiler's emission
    // order of one row per wasm instruction.
    let mut rows_by_addr: BTreeMap<u64, WasmLocation> = BTreeMap::new();

    let mut units = dwarf.units();
    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;
        let mut entries = unit.entries();
        let Some((_, root)) = entries.next_dfs()? else {
            continue;
        };
        let producer = match root.attr_value(gimli::DW_AT_producer)? {
            Some(attr) => dwarf.attr_string(&unit, attr)?.to_string_lossy(),
            None => continue,
        };
        if producer != LINE_TABLE_PRODUCER {
            continue;
        }
        let Some(program) = unit.line_program.clone() else {
            continue;
        };
        let mut rows = program.rows();
        while let Some((_, row)) = rows.next_row()? {
            if row.end_sequence() {
                continue;
            }
            let Some(line) = row.line() else {
                continue;
            };
            let insn_offset = match row.column() {
                gimli::ColumnType::Column(c) => c.get() as u32,
                gimli::ColumnType::LeftEdge => 0,
            };
            rows_by_addr.entry(row.address()).or_insert(WasmLocation {
                function: line.get() as u32,
                insn_offset,
            });
        }
    }

    Ok(rows_by_addr.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patchpoint_id_decodes_both_halves() {
        let loc = WasmLocation::from_patchpoint_id(0x0000_0007_0000_002a);
        assert_eq!(loc.function, 7);
        assert_eq!(loc.insn_offset, 42);
        assert_eq!(
            WasmLocation::from_patchpoint_id(u64::MAX),
            WasmLocation {
                function: u32::MAX,
                insn_offset: u32::MAX
            }
        );
    }

    #[test]
    fn floor_lookup_picks_greatest_at_or_below() {
        let loc = |function| WasmLocation {
            function,
            insn_offset: 0,
        };
        let rows = vec![(0x100, loc(0)), (0x110, loc(1)), (0x200, loc(2))];
        assert_eq!(lookup_floor(&rows, 0xff), None);
        assert_eq!(lookup_floor(&rows, 0x100).unwrap().1.function, 0);
        assert_eq!(lookup_floor(&rows, 0x10f).unwrap().1.function, 0);
        assert_eq!(lookup_floor(&rows, 0x110).unwrap().1.function, 1);
        assert_eq!(lookup_floor(&rows, 0x5000).unwrap().1.function, 2);
    }

    #[test]
    fn indexes_the_test_binary() {
        let image = ElfImage::open_self().unwrap();
        assert!(image.section(".text").is_some());
        assert!(image.section(".no_such_section").is_none());

        // The runtime's own exported API must resolve by name and offset.
        let pc = crate::api::memory_grow as usize as u64;
        let (name, offset) = image.resolve_symbol(pc).expect("memory_grow not found");
        assert_eq!(name, "memory_grow");
        assert_eq!(offset, 0);
        assert!(image.resolve_symbol(pc + 4).is_some());

        // No AOT module is linked into the test binary, so there is no wasm
        // line table to hit.
        assert_eq!(image.wasm_location_at(pc, false), None);
    }
}
