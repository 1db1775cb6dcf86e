//! Table-driven protocol-buffers wire encoding.
//!
//! Messages are opaque memory blocks described by layout tables the code
//! generator emits. Encoding is single-pass and writes backwards into a
//! growing buffer, so embedded message lengths never need a measuring
//! pre-pass.

pub mod arena;
pub mod base;
pub mod containers;
pub mod encoding;
pub mod tables;
pub mod wire;


pub use encoding::{DETERMINISTIC, EncodeError, SKIP_UNKNOWN, encode_raw, with_max_depth};

pub trait Protobuf: Sized {
    fn table() -> &'static tables::Table;

    fn as_object(&self) -> &base::Object {
        unsafe { &*(self as *const Self as *const base::Object) }
    }
}

/// Encodes `msg` into a buffer owned by `arena`.
pub fn encode<'a, T: Protobuf>(
    msg: &T,
    options: u32,
    arena: &'a mut arena::Arena<'_>,
) -> Result<&'a [u8], EncodeError> {
    encoding::encode_raw(msg.as_object(), T::table(), options, arena)
}

/// Encodes `msg` and copies the finished buffer into `writer`.
pub fn encode_to_write<T: Protobuf>(
    msg: &T,
    options: u32,
    writer: &mut impl std::io::Write,
) -> anyhow::Result<usize> {
    let mut arena = arena::Arena::new(&arena::HEAP);
    let buf = encode(msg, options, &mut arena)?;
    writer.write_all(buf)?;
    Ok(buf.len())
}
