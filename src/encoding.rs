//! The wire-format encoder.
//!
//! Serialize backwards, so that length prefixes are easy to write: a
//! sub-message's size is simply the byte count accumulated since entering it.
//! Fields are walked in reverse field-number order, which makes them come out
//! ascending in the finished buffer.

use core::ptr;

use crate::arena::Arena;
use crate::base::{Extension, Object};
use crate::containers::{Array, Bytes, Map, MapEntry};
use crate::tables::{DescriptorType, ExtMode, FieldEntry, MODE_ARRAY, MODE_MAP, NO_SLOT, Rep, Table};
use crate::wire::{
    OutBuf, WIRE_32BIT, WIRE_64BIT, WIRE_DELIMITED, WIRE_END_GROUP, WIRE_START_GROUP, WIRE_VARINT,
    zigzag32, zigzag64,
};

/// Sort map entries by key so equal messages encode byte-identically.
pub const DETERMINISTIC: u32 = 1 << 0;
/// Drop the unknown-field blob instead of re-emitting it.
pub const SKIP_UNKNOWN: u32 = 1 << 1;

/// The upper half of the options word overrides the recursion budget.
pub const DEPTH_SHIFT: u32 = 16;

const DEFAULT_MAX_DEPTH: u32 = 64;

/// Sets the maximum message nesting depth (0 restores the default of 64).
pub fn with_max_depth(options: u32, depth: u16) -> u32 {
    (options & 0xffff) | ((depth as u32) << DEPTH_SHIFT)
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    #[error("arena allocation failed while growing the encode buffer")]
    OutOfMemory,
    #[error("message nesting exceeds the recursion limit")]
    MaxDepthExceeded,
}

#[inline]
fn read<T: Copy>(mem: *const u8) -> T {
    unsafe { ptr::read_unaligned(mem as *const T) }
}

fn should_encode(msg: &Object, f: &FieldEntry) -> bool {
    if f.presence == 0 {
        // Implicit presence: suppress default values and empty containers.
        let mem = msg.field_ptr(f.offset);
        match f.rep() {
            Rep::OneByte => read::<u8>(mem) != 0,
            Rep::FourBytes => read::<u32>(mem) != 0,
            Rep::EightBytes => read::<u64>(mem) != 0,
            Rep::Bytes => !unsafe { &*(mem as *const Bytes) }.is_empty(),
            Rep::Pointer => !read::<*const u8>(mem).is_null(),
        }
    } else if f.presence > 0 {
        msg.has_bit(f.presence as u16)
    } else {
        msg.oneof_case(!f.presence as u16) == f.number
    }
}

fn compare_keys(
    key_type: DescriptorType,
    a: &crate::containers::ValueStorage,
    b: &crate::containers::ValueStorage,
) -> core::cmp::Ordering {
    use DescriptorType as DT;
    match key_type {
        DT::Bool => a.read::<bool>().cmp(&b.read::<bool>()),
        DT::Int32 | DT::Sint32 | DT::Sfixed32 => a.read::<i32>().cmp(&b.read::<i32>()),
        DT::Int64 | DT::Sint64 | DT::Sfixed64 => a.read::<i64>().cmp(&b.read::<i64>()),
        DT::Uint32 | DT::Fixed32 => a.read::<u32>().cmp(&b.read::<u32>()),
        DT::Uint64 | DT::Fixed64 => a.read::<u64>().cmp(&b.read::<u64>()),
        DT::String => a.bytes_view().cmp(b.bytes_view()),
        _ => unreachable!("invalid map key type"),
    }
}

struct Encoder<'a, 'arena> {
    buf: OutBuf<'a, 'arena>,
    options: u32,
    depth: u32,
    /// Reusable map-sorter scratch.
    sorter: Vec<u32>,
}

impl<'a, 'arena> Encoder<'a, 'arena> {
    #[inline]
    fn descend(&mut self) -> Result<(), EncodeError> {
        self.depth -= 1;
        if self.depth == 0 {
            return Err(EncodeError::MaxDepthExceeded);
        }
        Ok(())
    }

    #[inline]
    fn ascend(&mut self) {
        self.depth += 1;
    }

    fn encode_scalar(
        &mut self,
        mem: *const u8,
        subs: &[&'static Table],
        f: &FieldEntry,
    ) -> Result<(), EncodeError> {
        use DescriptorType as DT;
        let wire_type = match f.descriptor_type {
            DT::Double => {
                self.buf.write_fixed64(read::<f64>(mem).to_bits())?;
                WIRE_64BIT
            }
            DT::Float => {
                self.buf.write_fixed32(read::<f32>(mem).to_bits())?;
                WIRE_32BIT
            }
            DT::Int64 | DT::Uint64 => {
                self.buf.write_varint(read::<u64>(mem))?;
                WIRE_VARINT
            }
            DT::Uint32 => {
                self.buf.write_varint(read::<u32>(mem) as u64)?;
                WIRE_VARINT
            }
            // int32 sign-extends so negative values take the full ten bytes.
            DT::Int32 | DT::Enum => {
                self.buf.write_varint(read::<i32>(mem) as i64 as u64)?;
                WIRE_VARINT
            }
            DT::Fixed64 | DT::Sfixed64 => {
                self.buf.write_fixed64(read::<u64>(mem))?;
                WIRE_64BIT
            }
            DT::Fixed32 | DT::Sfixed32 => {
                self.buf.write_fixed32(read::<u32>(mem))?;
                WIRE_32BIT
            }
            DT::Bool => {
                self.buf.write_varint(read::<bool>(mem) as u64)?;
                WIRE_VARINT
            }
            DT::Sint32 => {
                self.buf.write_varint(zigzag32(read::<i32>(mem)) as u64)?;
                WIRE_VARINT
            }
            DT::Sint64 => {
                self.buf.write_varint(zigzag64(read::<i64>(mem)))?;
                WIRE_VARINT
            }
            DT::String | DT::Bytes => {
                let bytes = unsafe { &*(mem as *const Bytes) }.slice();
                self.buf.write_bytes(bytes)?;
                self.buf.write_varint(bytes.len() as u64)?;
                WIRE_DELIMITED
            }
            DT::Group => {
                let submsg = read::<*const Object>(mem);
                if submsg.is_null() {
                    return Ok(());
                }
                let sub = subs[f.sub_index as usize];
                self.descend()?;
                self.buf.write_tag(f.number, WIRE_END_GROUP)?;
                self.encode_message(unsafe { &*submsg }, sub)?;
                self.ascend();
                WIRE_START_GROUP
            }
            DT::Message => {
                let submsg = read::<*const Object>(mem);
                if submsg.is_null() {
                    return Ok(());
                }
                let sub = subs[f.sub_index as usize];
                self.descend()?;
                let size = self.encode_message(unsafe { &*submsg }, sub)?;
                self.buf.write_varint(size as u64)?;
                self.ascend();
                WIRE_DELIMITED
            }
        };
        self.buf.write_tag(f.number, wire_type)
    }

    fn encode_varint_array<T: Copy>(
        &mut self,
        arr: &Array,
        tag: u64,
        encode: impl Fn(T) -> u64,
    ) -> Result<(), EncodeError> {
        let slice = unsafe { arr.slice::<T>() };
        for &val in slice.iter().rev() {
            self.buf.write_varint(encode(val))?;
            if tag != 0 {
                self.buf.write_varint(tag)?;
            }
        }
        Ok(())
    }

    fn encode_fixed_array(
        &mut self,
        arr: &Array,
        elem_size: usize,
        tag: u64,
    ) -> Result<(), EncodeError> {
        if tag != 0 {
            for i in (0..arr.len()).rev() {
                let p = unsafe { arr.data().add(i * elem_size) };
                match elem_size {
                    4 => self.buf.write_fixed32(read::<u32>(p))?,
                    _ => self.buf.write_fixed64(read::<u64>(p))?,
                }
                self.buf.write_varint(tag)?;
            }
            return Ok(());
        }
        // Packed: element memory equals the wire image on little-endian hosts,
        // so one bulk copy suffices. Big-endian hosts swap per element.
        if cfg!(target_endian = "little") {
            let bytes = unsafe { core::slice::from_raw_parts(arr.data(), arr.len() * elem_size) };
            return self.buf.write_bytes(bytes);
        }
        for i in (0..arr.len()).rev() {
            let p = unsafe { arr.data().add(i * elem_size) };
            match elem_size {
                4 => self.buf.write_fixed32(read::<u32>(p))?,
                _ => self.buf.write_fixed64(read::<u64>(p))?,
            }
        }
        Ok(())
    }

    fn encode_array(
        &mut self,
        msg: &Object,
        subs: &[&'static Table],
        f: &FieldEntry,
    ) -> Result<(), EncodeError> {
        let arr_ptr = msg.get::<*const Array>(f.offset);
        if arr_ptr.is_null() {
            return Ok(());
        }
        let arr = unsafe { &*arr_ptr };
        if arr.is_empty() {
            return Ok(());
        }

        let packed = f.is_packed();
        let pre_len = self.buf.used();
        // Packed elements carry no per-element tag.
        let tag = |wire_type: u8| -> u64 {
            if packed {
                0
            } else {
                ((f.number as u64) << 3) | wire_type as u64
            }
        };

        use DescriptorType as DT;
        match f.descriptor_type {
            DT::Double | DT::Fixed64 | DT::Sfixed64 => {
                self.encode_fixed_array(arr, 8, tag(WIRE_64BIT))?
            }
            DT::Float | DT::Fixed32 | DT::Sfixed32 => {
                self.encode_fixed_array(arr, 4, tag(WIRE_32BIT))?
            }
            DT::Int64 | DT::Uint64 => self.encode_varint_array::<u64>(arr, tag(WIRE_VARINT), |v| v)?,
            DT::Uint32 => self.encode_varint_array::<u32>(arr, tag(WIRE_VARINT), |v| v as u64)?,
            DT::Int32 | DT::Enum => {
                self.encode_varint_array::<i32>(arr, tag(WIRE_VARINT), |v| v as i64 as u64)?
            }
            DT::Bool => self.encode_varint_array::<bool>(arr, tag(WIRE_VARINT), |v| v as u64)?,
            DT::Sint32 => {
                self.encode_varint_array::<i32>(arr, tag(WIRE_VARINT), |v| zigzag32(v) as u64)?
            }
            DT::Sint64 => self.encode_varint_array::<i64>(arr, tag(WIRE_VARINT), zigzag64)?,
            DT::String | DT::Bytes => {
                let slice = unsafe { arr.slice::<Bytes>() };
                for b in slice.iter().rev() {
                    let data = b.slice();
                    self.buf.write_bytes(data)?;
                    self.buf.write_varint(data.len() as u64)?;
                    self.buf.write_tag(f.number, WIRE_DELIMITED)?;
                }
                return Ok(());
            }
            DT::Group => {
                let slice = unsafe { arr.slice::<*const Object>() };
                let sub = subs[f.sub_index as usize];
                self.descend()?;
                for &child in slice.iter().rev() {
                    self.buf.write_tag(f.number, WIRE_END_GROUP)?;
                    self.encode_message(unsafe { &*child }, sub)?;
                    self.buf.write_tag(f.number, WIRE_START_GROUP)?;
                }
                self.ascend();
                return Ok(());
            }
            DT::Message => {
                let slice = unsafe { arr.slice::<*const Object>() };
                let sub = subs[f.sub_index as usize];
                self.descend()?;
                for &child in slice.iter().rev() {
                    let size = self.encode_message(unsafe { &*child }, sub)?;
                    self.buf.write_varint(size as u64)?;
                    self.buf.write_tag(f.number, WIRE_DELIMITED)?;
                }
                self.ascend();
                return Ok(());
            }
        }

        if packed {
            self.buf.write_varint((self.buf.used() - pre_len) as u64)?;
            self.buf.write_tag(f.number, WIRE_DELIMITED)?;
        }
        Ok(())
    }

    fn encode_mapentry(
        &mut self,
        number: u32,
        entry_table: &'static Table,
        ent: &MapEntry,
    ) -> Result<(), EncodeError> {
        let key_field = &entry_table.fields[0];
        let val_field = &entry_table.fields[1];
        let pre_len = self.buf.used();
        self.encode_scalar(ent.v.as_ptr(), entry_table.subs, val_field)?;
        self.encode_scalar(ent.k.as_ptr(), entry_table.subs, key_field)?;
        let size = self.buf.used() - pre_len;
        self.buf.write_varint(size as u64)?;
        self.buf.write_tag(number, WIRE_DELIMITED)
    }

    fn encode_map(
        &mut self,
        msg: &Object,
        subs: &[&'static Table],
        f: &FieldEntry,
    ) -> Result<(), EncodeError> {
        let map_ptr = msg.get::<*const Map>(f.offset);
        if map_ptr.is_null() {
            return Ok(());
        }
        let map = unsafe { &*map_ptr };
        let entry_table = subs[f.sub_index as usize];
        debug_assert_eq!(entry_table.fields.len(), 2);
        let entries = map.entries();

        if self.options & DETERMINISTIC != 0 {
            let key_type = entry_table.fields[0].descriptor_type;
            let mut order = core::mem::take(&mut self.sorter);
            order.clear();
            order.extend(0..entries.len() as u32);
            order.sort_unstable_by(|&a, &b| {
                compare_keys(key_type, &entries[a as usize].k, &entries[b as usize].k)
            });
            // Iterating the sorted view backwards puts keys ascending in the
            // finished buffer. On error the scratch is simply dropped.
            for &idx in order.iter().rev() {
                self.encode_mapentry(f.number, entry_table, &entries[idx as usize])?;
            }
            self.sorter = order;
        } else {
            for ent in entries {
                self.encode_mapentry(f.number, entry_table, ent)?;
            }
        }
        Ok(())
    }

    fn encode_field(
        &mut self,
        msg: &Object,
        subs: &[&'static Table],
        f: &FieldEntry,
    ) -> Result<(), EncodeError> {
        match f.storage() {
            MODE_ARRAY => self.encode_array(msg, subs, f),
            MODE_MAP => self.encode_map(msg, subs, f),
            _ => self.encode_scalar(msg.field_ptr(f.offset), subs, f),
        }
    }

    // message MessageSet {
    //   repeated group Item = 1 {
    //     required int32 type_id = 2;
    //     required string message = 3;
    //   }
    // }
    fn encode_msgset_item(&mut self, ext: &Extension) -> Result<(), EncodeError> {
        debug_assert_eq!(
            ext.desc.field.descriptor_type,
            DescriptorType::Message,
            "MessageSet extensions must be message-typed"
        );
        if ext.desc.field.descriptor_type != DescriptorType::Message {
            return Ok(());
        }
        let submsg = ext.data.read::<*const Object>();
        if submsg.is_null() {
            return Ok(());
        }
        let sub = ext.desc.subs[0];
        self.buf.write_tag(1, WIRE_END_GROUP)?;
        let size = self.encode_message(unsafe { &*submsg }, sub)?;
        self.buf.write_varint(size as u64)?;
        self.buf.write_tag(3, WIRE_DELIMITED)?;
        self.buf.write_varint(ext.desc.field.number as u64)?;
        self.buf.write_tag(2, WIRE_VARINT)?;
        self.buf.write_tag(1, WIRE_START_GROUP)
    }

    fn encode_message(&mut self, msg: &Object, table: &Table) -> Result<usize, EncodeError> {
        let pre_len = self.buf.used();

        // Written first, so the unknown blob trails the known fields.
        if self.options & SKIP_UNKNOWN == 0 && table.unknown_offset != NO_SLOT {
            self.buf.write_bytes(msg.bytes(table.unknown_offset))?;
        }

        if table.ext != ExtMode::None && table.ext_offset != NO_SLOT {
            // Extensions go out in storage order; no attempt is made to keep
            // them in field-number order relative to declared fields or to
            // each other.
            for ext in msg.extensions(table.ext_offset) {
                if table.ext == ExtMode::MessageSet {
                    self.encode_msgset_item(ext)?;
                } else {
                    self.encode_field(ext.as_object(), ext.desc.subs, &ext.desc.field)?;
                }
            }
        }

        for f in table.fields.iter().rev() {
            if should_encode(msg, f) {
                self.encode_field(msg, table.subs, f)?;
            }
        }

        Ok(self.buf.used() - pre_len)
    }
}

/// Encodes `msg` as described by `table` into a buffer borrowed from `arena`.
///
/// A message with nothing to emit yields `Ok` with an empty slice. On error
/// any partial buffer stays behind in the arena and is reclaimed with it.
pub fn encode_raw<'a>(
    msg: &Object,
    table: &'static Table,
    options: u32,
    arena: &'a mut Arena<'_>,
) -> Result<&'a [u8], EncodeError> {
    let depth = options >> DEPTH_SHIFT;
    let mut enc = Encoder {
        buf: OutBuf::new(arena),
        options,
        depth: if depth == 0 { DEFAULT_MAX_DEPTH } else { depth },
        sorter: Vec::new(),
    };
    enc.encode_message(msg, table)?;
    let (ptr, len) = enc.buf.parts();
    if len == 0 {
        return Ok(&[]);
    }
    Ok(unsafe { core::slice::from_raw_parts(ptr, len) })
}
