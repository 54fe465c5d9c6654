//! Snapshot codec: a length-prefixed, protobuf-shaped binary format.
//!
//! Field ids are stable and everything is little-endian on disk:
//!
//! ```text
//! Checkpoint { repeated Frame frames = 1; repeated Value globals = 2;
//!              repeated uint32 table = 3; uint32 memory_size = 4;
//!              oneof memory { bytes raw_memory = 5; bytes lz4_memory = 6; } }
//! Frame      { uint32 fn_index = 1; uint32 pc = 2;
//!              repeated Value locals = 3; repeated Value stack = 4; }
//! Value      { Type type = 1; oneof { sint i32 = 2; sint i64 = 3;
//!              fixed32 f32 = 4; fixed64 f64 = 5; } }
//! ```
//!
//! Frames are emitted outermost-caller-first and decoded in the same order.
//! The memory payload, decompressed if need be, must be exactly
//! `memory_size * 65536` bytes. `lz4_memory` is the LZ4 block format and is
//! preferred when the `lz4` cargo feature is enabled; the decoder accepts
//! either form.

use std::fs::File;
use std::io::Write;

use anyhow::{Context, Result};
use log::{debug, info};
use thiserror::Error;

use crate::checkpoint::{Checkpoint, Frame};
use crate::memory::{self, PAGE_SIZE};
use crate::value::{ValType, Value};

/// Snapshot file written into the working directory.
pub const SNAPSHOT_FILE: &str = "checkpoint.pb";

const WIRE_VARINT: u32 = 0;
const WIRE_FIXED64: u32 = 1;
const WIRE_LEN: u32 = 2;
const WIRE_FIXED32: u32 = 5;

// Checkpoint fields.
const F_FRAMES: u32 = 1;
const F_GLOBALS: u32 = 2;
const F_TABLE: u32 = 3;
const F_MEMORY_SIZE: u32 = 4;
const F_RAW_MEMORY: u32 = 5;
const F_LZ4_MEMORY: u32 = 6;

// Frame fields.
const F_FN_INDEX: u32 = 1;
const F_PC: u32 = 2;
const F_LOCALS: u32 = 3;
const F_STACK: u32 = 4;

// Value fields.
const F_TYPE: u32 = 1;
const F_I32: u32 = 2;
const F_I64: u32 = 3;
const F_F32: u32 = 4;
const F_F64: u32 = 5;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("unexpected end of snapshot data")]
    UnexpectedEof,
    #[error("varint longer than ten bytes")]
    VarintOverflow,
    #[error("unsupported wire type {0}")]
    UnknownWireType(u32),
    #[error("invalid value type tag {0}")]
    InvalidValueType(u64),
    #[error("value record payload does not match its type tag")]
    ValueTypeMismatch,
    #[error("snapshot carries no memory payload")]
    MissingMemory,
    #[error("memory payload is {actual} bytes but the page count implies {expected}")]
    MemoryLength { expected: usize, actual: usize },
    #[error("LZ4 decompression failed: {0}")]
    Lz4(#[from] lz4_flex::block::DecompressError),
}

/* Encoding */

fn put_varint(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn put_tag(buf: &mut Vec<u8>, field: u32, wire: u32) {
    put_varint(buf, ((field << 3) | wire) as u64);
}

fn put_len_field(buf: &mut Vec<u8>, field: u32, bytes: &[u8]) {
    put_tag(buf, field, WIRE_LEN);
    put_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn put_varint_field(buf: &mut Vec<u8>, field: u32, v: u64) {
    put_tag(buf, field, WIRE_VARINT);
    put_varint(buf, v);
}

fn encode_value(buf: &mut Vec<u8>, value: &Value) {
    put_varint_field(buf, F_TYPE, value.ty() as u64);
    match *value {
        Value::I32(v) => put_varint_field(buf, F_I32, v as i64 as u64),
        Value::I64(v) => put_varint_field(buf, F_I64, v as u64),
        Value::F32(v) => {
            put_tag(buf, F_F32, WIRE_FIXED32);
            buf.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        Value::F64(v) => {
            put_tag(buf, F_F64, WIRE_FIXED64);
            buf.extend_from_slice(&v.to_bits().to_le_bytes());
        }
    }
}

fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut buf = Vec::new();
    put_varint_field(&mut buf, F_FN_INDEX, frame.fn_index as u64);
    put_varint_field(&mut buf, F_PC, frame.pc as u64);
    let mut value_buf = Vec::new();
    for local in &frame.locals {
        value_buf.clear();
        encode_value(&mut value_buf, local);
        put_len_field(&mut buf, F_LOCALS, &value_buf);
    }
    for value in &frame.stack {
        value_buf.clear();
        encode_value(&mut value_buf, value);
        put_len_field(&mut buf, F_STACK, &value_buf);
    }
    buf
}

fn encode_with(chkpt: &Checkpoint, memory: &[u8], compress: bool) -> Vec<u8> {
    // The operand stacks are carried per frame at write time; a non-empty
    // restore queue means someone serialized mid-restore.
    assert!(
        chkpt.restore_stack.is_empty(),
        "snapshot written with a primed restore stack"
    );
    assert_eq!(
        memory.len(),
        chkpt.memory_pages as usize * PAGE_SIZE,
        "memory payload does not match the page count"
    );

    let mut buf = Vec::new();
    for frame in &chkpt.frames {
        put_len_field(&mut buf, F_FRAMES, &encode_frame(frame));
    }
    let mut value_buf = Vec::new();
    for global in &chkpt.globals {
        value_buf.clear();
        encode_value(&mut value_buf, global);
        put_len_field(&mut buf, F_GLOBALS, &value_buf);
    }
    for entry in &chkpt.table {
        put_varint_field(&mut buf, F_TABLE, *entry as u64);
    }
    put_varint_field(&mut buf, F_MEMORY_SIZE, chkpt.memory_pages as u64);

    if compress {
        let compressed = lz4_flex::block::compress(memory);
        debug!(
            "compressed memory payload {} -> {} bytes",
            memory.len(),
            compressed.len()
        );
        put_len_field(&mut buf, F_LZ4_MEMORY, &compressed);
    } else {
        put_len_field(&mut buf, F_RAW_MEMORY, memory);
    }
    buf
}

/// Serialize a checkpoint and the linear-memory contents.
pub fn encode(chkpt: &Checkpoint, memory: &[u8]) -> Vec<u8> {
    encode_with(chkpt, memory, cfg!(feature = "lz4"))
}

/// Write the snapshot file in one contiguous operation. Success is only
/// reported once the stream has been flushed and closed.
pub fn write_file(path: &str, chkpt: &Checkpoint, memory: &[u8]) -> Result<()> {
    let bytes = encode(chkpt, memory);
    let mut file =
        File::create(path).with_context(|| format!("failed to create snapshot file {path}"))?;
    file.write_all(&bytes)
        .and_then(|()| file.sync_all())
        .with_context(|| format!("failed to write snapshot file {path}"))?;
    Ok(())
}

/* Decoding */

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Decoder<'a> {
        Decoder { data, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], SnapshotError> {
        if self.pos + n > self.data.len() {
            return Err(SnapshotError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn varint(&mut self) -> Result<u64, SnapshotError> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.bytes(1)?[0];
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(SnapshotError::VarintOverflow)
    }

    fn tag(&mut self) -> Result<(u32, u32), SnapshotError> {
        let tag = self.varint()? as u32;
        Ok((tag >> 3, tag & 0x7))
    }

    fn fixed32(&mut self) -> Result<u32, SnapshotError> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn fixed64(&mut self) -> Result<u64, SnapshotError> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn len_delimited(&mut self) -> Result<&'a [u8], SnapshotError> {
        let len = self.varint()? as usize;
        self.bytes(len)
    }

    /// Skip a field this decoder does not know.
    fn skip(&mut self, wire: u32) -> Result<(), SnapshotError> {
        match wire {
            WIRE_VARINT => self.varint().map(|_| ()),
            WIRE_FIXED64 => self.bytes(8).map(|_| ()),
            WIRE_LEN => self.len_delimited().map(|_| ()),
            WIRE_FIXED32 => self.bytes(4).map(|_| ()),
            other => Err(SnapshotError::UnknownWireType(other)),
        }
    }
}

fn decode_value(data: &[u8]) -> Result<Value, SnapshotError> {
    let mut d = Decoder::new(data);
    let mut ty = None;
    let mut payload = None;
    while !d.done() {
        let (field, wire) = d.tag()?;
        match field {
            F_TYPE => ty = Some(d.varint()?),
            F_I32 => payload = Some(Value::I32(d.varint()? as i64 as i32)),
            F_I64 => payload = Some(Value::I64(d.varint()? as i64)),
            F_F32 => payload = Some(Value::F32(f32::from_bits(d.fixed32()?))),
            F_F64 => payload = Some(Value::F64(f64::from_bits(d.fixed64()?))),
            _ => d.skip(wire)?,
        }
    }
    let ty = ty.ok_or(SnapshotError::ValueTypeMismatch)?;
    let ty = ValType::from_encoding(ty as i64).map_err(|_| SnapshotError::InvalidValueType(ty))?;
    let value = payload.ok_or(SnapshotError::ValueTypeMismatch)?;
    if value.ty() != ty {
        return Err(SnapshotError::ValueTypeMismatch);
    }
    Ok(value)
}

fn decode_frame(data: &[u8]) -> Result<Frame, SnapshotError> {
    let mut d = Decoder::new(data);
    let mut frame = Frame::new();
    while !d.done() {
        let (field, wire) = d.tag()?;
        match field {
            F_FN_INDEX => frame.fn_index = d.varint()? as u32,
            F_PC => frame.pc = d.varint()? as u32,
            F_LOCALS => frame.locals.push_back(decode_value(d.len_delimited()?)?),
            F_STACK => frame.stack.push(decode_value(d.len_delimited()?)?),
            _ => d.skip(wire)?,
        }
    }
    Ok(frame)
}

/// The encoded linear-memory payload, still in its on-disk form.
pub enum MemoryImage<'a> {
    Raw(&'a [u8]),
    Lz4(&'a [u8]),
}

impl MemoryImage<'_> {
    /// Materialize the payload into `dst`, which must already have the
    /// exact length the snapshot's page count implies.
    pub fn copy_into(&self, dst: &mut [u8]) -> Result<(), SnapshotError> {
        match self {
            MemoryImage::Raw(bytes) => {
                if bytes.len() != dst.len() {
                    return Err(SnapshotError::MemoryLength {
                        expected: dst.len(),
                        actual: bytes.len(),
                    });
                }
                dst.copy_from_slice(bytes);
            }
            MemoryImage::Lz4(bytes) => {
                let n = lz4_flex::block::decompress_into(bytes, dst)?;
                if n != dst.len() {
                    return Err(SnapshotError::MemoryLength {
                        expected: dst.len(),
                        actual: n,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Decode a snapshot into the checkpoint state plus the not-yet-copied
/// memory payload.
pub fn decode(data: &[u8]) -> Result<(Checkpoint, MemoryImage<'_>), SnapshotError> {
    let mut d = Decoder::new(data);
    let mut chkpt = Checkpoint::new();
    let mut memory = None;
    while !d.done() {
        let (field, wire) = d.tag()?;
        match field {
            F_FRAMES => chkpt.frames.push_back(decode_frame(d.len_delimited()?)?),
            F_GLOBALS => chkpt.globals.push_back(decode_value(d.len_delimited()?)?),
            F_TABLE => chkpt.table.push_back(d.varint()? as u32),
            F_MEMORY_SIZE => chkpt.memory_pages = d.varint()? as u32,
            F_RAW_MEMORY => memory = Some(MemoryImage::Raw(d.len_delimited()?)),
            F_LZ4_MEMORY => memory = Some(MemoryImage::Lz4(d.len_delimited()?)),
            _ => d.skip(wire)?,
        }
    }
    let memory = memory.ok_or(SnapshotError::MissingMemory)?;
    Ok((chkpt, memory))
}

/// Load a snapshot file: decode it, allocate the linear memory at its
/// recorded page count and populate it. Returns the checkpoint state and
/// the freshly allocated memory base.
pub fn read_file(path: &str) -> Result<(Checkpoint, *mut u8)> {
    let data =
        std::fs::read(path).with_context(|| format!("failed to read snapshot file {path}"))?;
    let (chkpt, image) = decode(&data)
        .with_context(|| format!("failed to decode snapshot file {path}"))?;

    let base = memory::allocate(chkpt.memory_pages)?;
    let dst = unsafe {
        std::slice::from_raw_parts_mut(base, chkpt.memory_pages as usize * PAGE_SIZE)
    };
    image
        .copy_into(dst)
        .context("failed to materialize the linear-memory payload")?;
    info!(
        "loaded snapshot {path}: {} frames, {} globals, {} pages",
        chkpt.frames.len(),
        chkpt.globals.len(),
        chkpt.memory_pages
    );
    Ok((chkpt, base))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Read;

    fn sample_checkpoint() -> Checkpoint {
        let mut chkpt = Checkpoint::new();
        chkpt.frames.push_back(Frame {
            fn_index: 1,
            pc: 12,
            locals: VecDeque::from(vec![Value::I32(-7), Value::F32(1.5)]),
            stack: vec![Value::I64(i64::MIN)],
        });
        chkpt.frames.push_back(Frame {
            fn_index: 2,
            pc: 0,
            locals: VecDeque::new(),
            stack: vec![Value::F64(f64::from_bits(0x7ff8_0000_c0ff_ee00))],
        });
        chkpt.globals = VecDeque::from(vec![
            Value::I32(42),
            Value::F64(3.14),
            Value::I64(-1),
        ]);
        chkpt.table = VecDeque::from(vec![0, 3, 1]);
        chkpt.memory_pages = 1;
        chkpt
    }

    fn sample_memory() -> Vec<u8> {
        (0..PAGE_SIZE).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn round_trips_raw_and_compressed() {
        let chkpt = sample_checkpoint();
        let memory = sample_memory();

        for compress in [false, true] {
            let bytes = encode_with(&chkpt, &memory, compress);
            let (decoded, image) = decode(&bytes).unwrap();
            assert_eq!(decoded, chkpt);

            let mut out = vec![0u8; memory.len()];
            image.copy_into(&mut out).unwrap();
            assert_eq!(out, memory);
        }
    }

    #[test]
    fn frames_keep_outermost_first_order() {
        let chkpt = sample_checkpoint();
        let bytes = encode_with(&chkpt, &sample_memory(), false);
        let (decoded, _) = decode(&bytes).unwrap();
        let indices: Vec<u32> = decoded.frames.iter().map(|f| f.fn_index).collect();
        assert_eq!(indices, vec![1, 2]);
    }

    #[test]
    fn empty_checkpoint_round_trips() {
        let mut chkpt = Checkpoint::new();
        chkpt.memory_pages = 0;
        let bytes = encode_with(&chkpt, &[], false);
        let (decoded, image) = decode(&bytes).unwrap();
        assert_eq!(decoded, chkpt);
        image.copy_into(&mut []).unwrap();
    }

    #[test]
    fn rejects_truncation_and_missing_memory() {
        let bytes = encode_with(&sample_checkpoint(), &sample_memory(), false);
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1]),
            Err(SnapshotError::UnexpectedEof)
        ));

        let mut chkpt = Checkpoint::new();
        chkpt.memory_pages = 0;
        let mut no_memory = Vec::new();
        put_varint_field(&mut no_memory, F_MEMORY_SIZE, 0);
        assert!(matches!(
            decode(&no_memory),
            Err(SnapshotError::MissingMemory)
        ));
    }

    #[test]
    fn rejects_wrong_memory_length() {
        let bytes = encode_with(&sample_checkpoint(), &sample_memory(), false);
        let (_, image) = decode(&bytes).unwrap();
        let mut too_small = vec![0u8; PAGE_SIZE - 1];
        assert!(matches!(
            image.copy_into(&mut too_small),
            Err(SnapshotError::MemoryLength { .. })
        ));
    }

    #[test]
    fn value_type_and_payload_must_agree() {
        let mut buf = Vec::new();
        put_varint_field(&mut buf, F_TYPE, ValType::F64 as u64);
        put_varint_field(&mut buf, F_I32, 3);
        assert!(matches!(
            decode_value(&buf),
            Err(SnapshotError::ValueTypeMismatch)
        ));

        let mut buf = Vec::new();
        put_varint_field(&mut buf, F_TYPE, 9);
        put_varint_field(&mut buf, F_I32, 3);
        assert!(matches!(
            decode_value(&buf),
            Err(SnapshotError::InvalidValueType(9))
        ));
    }

    #[test]
    fn writes_the_snapshot_file_in_one_piece() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.pb");
        let path = path.to_str().unwrap();

        let chkpt = sample_checkpoint();
        let memory = sample_memory();
        write_file(path, &chkpt, &memory).unwrap();

        let mut data = Vec::new();
        File::open(path).unwrap().read_to_end(&mut data).unwrap();
        let (decoded, _) = decode(&data).unwrap();
        assert_eq!(decoded, chkpt);
    }
}
