//! Static memory layout.
//!
//! Static memory starts at `max(memory_base, 8)`; the first eight bytes
//! stay reserved as a null sentinel. Segments are append-only and aligned
//! on placement, so the layout is final the moment an offset is handed
//! out. Strings are canonicalised by content; static arrays emit a
//! power-of-two-sized backing buffer plus an `Array` header pointing into
//! it.

use crate::compiler::codegen::{align_up, Compiler};
use crate::compiler::diagnostics::CompileError;
use crate::compiler::types::Type;
use crate::compiler::wir::nodes::Literal;

/// Backing-buffer header: `[byte_length: i32, padding: u32]`.
pub const ARRAY_BUFFER_HEADER_SIZE: u64 = 8;

/// GC header reserved in front of managed objects: one pointer-sized word
/// holding the class's hook index.
pub const GC_HEADER_SIZE: u64 = 8;

impl<'a> Compiler<'a> {
    /// Append a static segment, aligning its start. Returns the offset
    /// the data was placed at. `memory_offset` never decreases.
    pub fn add_static_segment(&mut self, data: Vec<u8>, align: u64) -> u64 {
        debug_assert!(align.is_power_of_two());
        let offset = align_up(self.memory_offset, align);
        self.memory_offset = offset + data.len() as u64;
        self.module.add_memory_segment(offset, data);
        offset
    }

    /// Intern a static string, returning the pointer to its body
    /// (`[length: i32][code units: u16 * length]`). Equal contents share
    /// one segment. A GC header is reserved in front when GC hooks are in
    /// use.
    pub fn ensure_static_string(&mut self, content: &str) -> u64 {
        if let Some(&pointer) = self.string_segments.get(content) {
            return pointer;
        }
        let code_units: Vec<u16> = content.encode_utf16().collect();
        let header = if self.gc_hook_indices.is_empty() {
            0
        } else {
            GC_HEADER_SIZE
        };
        let mut data = Vec::with_capacity(header as usize + 4 + code_units.len() * 2);
        if header != 0 {
            // First word is the string class's hook index; zero when the
            // string class itself registered no hook.
            data.extend_from_slice(&0u64.to_le_bytes());
        }
        data.extend_from_slice(&(code_units.len() as i32).to_le_bytes());
        for unit in &code_units {
            data.extend_from_slice(&unit.to_le_bytes());
        }
        let offset = self.add_static_segment(data, 8);
        let pointer = offset + header;
        self.string_segments.insert(content.to_string(), pointer);
        pointer
    }

    /// Emit a static array: a backing buffer rounded up to the next power
    /// of two of `header + length * element_size`, then an `Array` header
    /// `[buffer: usize][length: i32]` pointing at it. Returns the header
    /// pointer.
    pub fn compile_static_array(
        &mut self,
        element_type: &Type,
        values: &[Literal],
    ) -> Result<u64, CompileError> {
        let element_size = element_type.size as u64;
        let payload = ARRAY_BUFFER_HEADER_SIZE + values.len() as u64 * element_size;
        let buffer_size = payload.next_power_of_two();

        let mut buffer = vec![0u8; buffer_size as usize];
        let byte_length = (values.len() as u64 * element_size) as i32;
        buffer[0..4].copy_from_slice(&byte_length.to_le_bytes());
        let mut cursor = ARRAY_BUFFER_HEADER_SIZE as usize;
        for value in values {
            write_literal(&mut buffer, cursor, *value, element_size)?;
            cursor += element_size as usize;
        }
        let buffer_offset = self.add_static_segment(buffer, 8);

        let pointer_size = self.options.pointer_size() as usize;
        let mut header = Vec::with_capacity(pointer_size + 4);
        if pointer_size == 8 {
            header.extend_from_slice(&buffer_offset.to_le_bytes());
        } else {
            header.extend_from_slice(&(buffer_offset as u32).to_le_bytes());
        }
        header.extend_from_slice(&(values.len() as i32).to_le_bytes());
        Ok(self.add_static_segment(header, 8))
    }
}

/// Write one element into a buffer at `offset`, dispatching on the
/// element width.
fn write_literal(
    buffer: &mut [u8],
    offset: usize,
    value: Literal,
    element_size: u64,
) -> Result<(), CompileError> {
    match (value, element_size) {
        (Literal::I32(v), 1) => buffer[offset] = v as u8,
        (Literal::I32(v), 2) => {
            buffer[offset..offset + 2].copy_from_slice(&(v as i16).to_le_bytes())
        }
        (Literal::I32(v), 4) => buffer[offset..offset + 4].copy_from_slice(&v.to_le_bytes()),
        (Literal::I64(v), 8) => buffer[offset..offset + 8].copy_from_slice(&v.to_le_bytes()),
        (Literal::F32(v), 4) => buffer[offset..offset + 4].copy_from_slice(&v.to_le_bytes()),
        (Literal::F64(v), 8) => buffer[offset..offset + 8].copy_from_slice(&v.to_le_bytes()),
        _ => {
            return Err(CompileError::internal(format!(
                "cannot write {:?} as a {}-byte array element",
                value, element_size
            )));
        }
    }
    Ok(())
}
