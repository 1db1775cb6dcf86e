//! Runtime layout tables driving the encoder.
//!
//! A [`Table`] describes one message type: its fields sorted by field number,
//! a sub-layout lookup table for message-typed fields, and where the unknown
//! field blob and the extension list live inside the message memory. Tables
//! are produced by code generation and consumed read-only.

/// Proto descriptor types, discriminants matching descriptor.proto.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DescriptorType {
    Double = 1,
    Float = 2,
    Int64 = 3,
    Uint64 = 4,
    Int32 = 5,
    Fixed64 = 6,
    Fixed32 = 7,
    Bool = 8,
    String = 9,
    Group = 10,
    Message = 11,
    Bytes = 12,
    Uint32 = 13,
    Enum = 14,
    Sfixed32 = 15,
    Sfixed64 = 16,
    Sint32 = 17,
    Sint64 = 18,
}

/// In-memory representation of a field's value slot.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Rep {
    OneByte = 0,
    FourBytes = 1,
    EightBytes = 2,
    /// A `Bytes` container stored inline.
    Bytes = 3,
    /// A raw pointer (sub-message, array handle, map handle).
    Pointer = 4,
}

pub const MODE_SCALAR: u8 = 0;
pub const MODE_ARRAY: u8 = 1;
pub const MODE_MAP: u8 = 2;
pub const MODE_MASK: u8 = 3;
pub const MODE_PACKED: u8 = 1 << 2;
pub const MODE_EXTENSION: u8 = 1 << 3;
pub const REP_SHIFT: u8 = 4;

pub const fn rep_bits(rep: Rep) -> u8 {
    (rep as u8) << REP_SHIFT
}

/// Sentinel for the optional `Table` slots.
pub const NO_SLOT: u16 = u16::MAX;

/// One field of a message layout.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct FieldEntry {
    pub number: u32,
    /// Byte offset of the value slot within the message memory.
    pub offset: u16,
    /// 0 = implicit presence, >0 = 1-based hasbit index,
    /// <0 = bitwise-NOT of the oneof case offset.
    pub presence: i16,
    /// Index into `Table::subs` for message-typed fields.
    pub sub_index: u16,
    pub descriptor_type: DescriptorType,
    /// Storage mode, packed bit, extension bit and value representation.
    pub mode: u8,
}

impl FieldEntry {
    #[inline]
    pub fn storage(&self) -> u8 {
        self.mode & MODE_MASK
    }

    #[inline]
    pub fn is_packed(&self) -> bool {
        self.mode & MODE_PACKED != 0
    }

    #[inline]
    pub fn is_extension(&self) -> bool {
        self.mode & MODE_EXTENSION != 0
    }

    #[inline]
    pub fn rep(&self) -> Rep {
        match self.mode >> REP_SHIFT {
            0 => Rep::OneByte,
            1 => Rep::FourBytes,
            2 => Rep::EightBytes,
            3 => Rep::Bytes,
            _ => Rep::Pointer,
        }
    }
}

/// Extension shape of a message type.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExtMode {
    None,
    Extendable,
    /// Legacy MessageSet wire shape; every extension must be message-typed.
    MessageSet,
}

/// Layout of one message type.
pub struct Table {
    /// Sorted by field number ascending.
    pub fields: &'static [FieldEntry],
    /// Sub-layouts referenced by `FieldEntry::sub_index`.
    pub subs: &'static [&'static Table],
    /// Size of the message struct. Not consulted by the encoder.
    pub size: u16,
    /// Offset of the unknown-field `Bytes` blob, or `NO_SLOT`.
    pub unknown_offset: u16,
    /// Offset of the extension list, or `NO_SLOT`.
    pub ext_offset: u16,
    pub ext: ExtMode,
}

/// Descriptor for a registered extension field. The field's offset is zero:
/// extension values live in a standalone storage cell, not in the message.
pub struct ExtensionDesc {
    pub field: FieldEntry,
    /// Empty, or a single entry for message-typed extensions.
    pub subs: &'static [&'static Table],
}
