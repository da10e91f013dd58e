// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Decoding rules for the binary format's grammar, from primitives up to
//! section contents.

use num_enum::TryFromPrimitive;

use crate::Allocator;
use crate::compat::vec::Vec;
use crate::stream::Stream;
use crate::types::*;

use super::{Context, Decodable, Decoder, Error, Scalar, Trail};

// The cap on a single function's expanded locals list. The format would
// allow up to 2^32 - 1 per run-length group; the cap (borrowed from the
// wider ecosystem) bounds what one decoded entry can demand.
const MAX_FUNCTION_LOCALS: usize = 50_000;

// Byte-tagged enums: one byte, mapped through `TryFromPrimitive`, with any
// unlisted byte rejected.
macro_rules! scalar_byte_tag {
    ($($type:ty => $context:expr),* $(,)?) => {$(
        impl Scalar for $type {
            const CONTEXT: Context = $context;

            fn decode<S: Stream>(
                decoder: &mut Decoder<S>,
                _: &mut Trail,
            ) -> Result<Self, Error<S>> {
                let found = decoder.consume()?;
                Self::try_from(found).map_err(|_| Error::Unexpected {
                    found,
                    expected: None,
                })
            }
        }
    )*};
}

// Index newtypes: a LEB128 u32 wrapped in its space's type.
macro_rules! scalar_index {
    ($($type:ty => $context:expr),* $(,)?) => {$(
        impl Scalar for $type {
            const CONTEXT: Context = $context;

            fn decode<S: Stream>(
                decoder: &mut Decoder<S>,
                trail: &mut Trail,
            ) -> Result<Self, Error<S>> {
                Ok(Self(decoder.read_plain::<u32>(trail)?))
            }
        }
    )*};
}

impl Scalar for u8 {
    const CONTEXT: Context = Context::Byte;

    fn decode<S: Stream>(decoder: &mut Decoder<S>, _: &mut Trail) -> Result<Self, Error<S>> {
        decoder.consume()
    }
}

impl Scalar for u32 {
    const CONTEXT: Context = Context::U32;

    fn decode<S: Stream>(decoder: &mut Decoder<S>, _: &mut Trail) -> Result<Self, Error<S>> {
        decoder.read_varint()
    }
}

impl Scalar for i32 {
    const CONTEXT: Context = Context::I32;

    fn decode<S: Stream>(decoder: &mut Decoder<S>, _: &mut Trail) -> Result<Self, Error<S>> {
        decoder.read_varint()
    }
}

impl Scalar for i64 {
    const CONTEXT: Context = Context::I64;

    fn decode<S: Stream>(decoder: &mut Decoder<S>, _: &mut Trail) -> Result<Self, Error<S>> {
        decoder.read_varint()
    }
}

impl Scalar for f32 {
    const CONTEXT: Context = Context::F32;

    fn decode<S: Stream>(decoder: &mut Decoder<S>, _: &mut Trail) -> Result<Self, Error<S>> {
        let mut buf = [0u8; 4];
        decoder.read_exact_raw(&mut buf)?;
        Ok(f32::from_le_bytes(buf))
    }
}

impl Scalar for f64 {
    const CONTEXT: Context = Context::F64;

    fn decode<S: Stream>(decoder: &mut Decoder<S>, _: &mut Trail) -> Result<Self, Error<S>> {
        let mut buf = [0u8; 8];
        decoder.read_exact_raw(&mut buf)?;
        Ok(f64::from_le_bytes(buf))
    }
}

scalar_byte_tag! {
    SectionId => Context::Section,
    ValType => Context::ValType,
    ElemType => Context::ElemType,
    Mutability => Context::Mut,
    Opcode => Context::Opcode,
    LimitsFlag => Context::Byte,
    ImportKind => Context::Byte,
    ExportKind => Context::Byte,
}

scalar_index! {
    TypeIdx => Context::TypeIdx,
    FuncIdx => Context::FuncIdx,
    TableIdx => Context::TableIdx,
    MemIdx => Context::MemIdx,
    GlobalIdx => Context::GlobalIdx,
    LocalIdx => Context::LocalIdx,
    LabelIdx => Context::LabelIdx,
}

// Generic vectors: a u32 count followed by that many elements. The count's
// worth of space is reserved up front, so absurd counts fail as allocation
// errors before any elements are read, and short inputs fail at the first
// missing element.
impl<T, A> Decodable<A> for Vec<T, A>
where
    T: Decodable<A>,
    A: Allocator,
{
    const CONTEXT: Context = Context::Vec;

    fn decode<S: Stream>(
        decoder: &mut Decoder<S>,
        trail: &mut Trail,
        alloc: &A,
    ) -> Result<Self, Error<S>> {
        let len: u32 = decoder.read_plain(trail)?;
        let mut vec = Vec::new_in(alloc.clone());
        vec.try_reserve_exact(len as usize)?;
        for _ in 0..len {
            vec.push(decoder.read(trail, alloc)?);
        }
        Ok(vec)
    }
}

impl<A: Allocator> Decodable<A> for Name<A> {
    const CONTEXT: Context = Context::Name;

    fn decode<S: Stream>(
        decoder: &mut Decoder<S>,
        trail: &mut Trail,
        alloc: &A,
    ) -> Result<Self, Error<S>> {
        let len: u32 = decoder.read_plain(trail)?;
        let bytes = decoder.read_bytes(trail, len as usize, alloc)?;
        match str::from_utf8(&bytes) {
            Ok(_) => Ok(Name::from_utf8_unchecked(bytes)),
            Err(err) => Err(Error::InvalidUnicode {
                valid_up_to: err.valid_up_to(),
            }),
        }
    }
}

impl<A: Allocator> Decodable<A> for FunctionType<A> {
    const CONTEXT: Context = Context::FuncType;

    fn decode<S: Stream>(
        decoder: &mut Decoder<S>,
        trail: &mut Trail,
        alloc: &A,
    ) -> Result<Self, Error<S>> {
        decoder.consume_expected(0x60)?;
        Ok(Self {
            params: decoder.read(trail, alloc)?,
            results: decoder.read(trail, alloc)?,
        })
    }
}

#[derive(Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
enum LimitsFlag {
    Min = 0x00,
    MinMax = 0x01,
}

impl Scalar for Limits {
    const CONTEXT: Context = Context::Limits;

    fn decode<S: Stream>(decoder: &mut Decoder<S>, trail: &mut Trail) -> Result<Self, Error<S>> {
        let flag: LimitsFlag = decoder.read_plain(trail)?;
        let min: u32 = decoder.read_plain(trail)?;
        let max = match flag {
            LimitsFlag::Min => None,
            LimitsFlag::MinMax => Some(decoder.read_plain(trail)?),
        };
        Ok(Self { min, max })
    }
}

impl Scalar for TableType {
    const CONTEXT: Context = Context::TableType;

    fn decode<S: Stream>(decoder: &mut Decoder<S>, trail: &mut Trail) -> Result<Self, Error<S>> {
        Ok(Self {
            element: decoder.read_plain(trail)?,
            limits: decoder.read_plain(trail)?,
        })
    }
}

impl Scalar for MemoryType {
    const CONTEXT: Context = Context::MemType;

    fn decode<S: Stream>(decoder: &mut Decoder<S>, trail: &mut Trail) -> Result<Self, Error<S>> {
        Ok(Self {
            limits: decoder.read_plain(trail)?,
        })
    }
}

impl Scalar for GlobalType {
    const CONTEXT: Context = Context::GlobalType;

    fn decode<S: Stream>(decoder: &mut Decoder<S>, trail: &mut Trail) -> Result<Self, Error<S>> {
        // On the wire the value type precedes the mutability flag.
        let value: ValType = decoder.read_plain(trail)?;
        let mutability: Mutability = decoder.read_plain(trail)?;
        Ok(Self { mutability, value })
    }
}

impl Scalar for BlockType {
    const CONTEXT: Context = Context::BlockType;

    fn decode<S: Stream>(decoder: &mut Decoder<S>, _: &mut Trail) -> Result<Self, Error<S>> {
        let found = decoder.consume()?;
        if found == 0x40 {
            return Ok(BlockType::Empty);
        }
        match ValType::try_from(found) {
            Ok(ty) => Ok(BlockType::Value(ty)),
            Err(_) => Err(Error::Unexpected {
                found,
                expected: None,
            }),
        }
    }
}

impl Scalar for MemArg {
    const CONTEXT: Context = Context::MemArg;

    fn decode<S: Stream>(decoder: &mut Decoder<S>, trail: &mut Trail) -> Result<Self, Error<S>> {
        Ok(Self {
            align: decoder.read_plain(trail)?,
            offset: decoder.read_plain(trail)?,
        })
    }
}

#[derive(Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
enum ImportKind {
    Function = 0x00,
    Table = 0x01,
    Memory = 0x02,
    Global = 0x03,
}

impl Scalar for ImportDesc {
    const CONTEXT: Context = Context::ImportDesc;

    fn decode<S: Stream>(decoder: &mut Decoder<S>, trail: &mut Trail) -> Result<Self, Error<S>> {
        match decoder.read_plain(trail)? {
            ImportKind::Function => Ok(Self::Function(decoder.read_plain(trail)?)),
            ImportKind::Table => Ok(Self::Table(decoder.read_plain(trail)?)),
            ImportKind::Memory => Ok(Self::Memory(decoder.read_plain(trail)?)),
            ImportKind::Global => Ok(Self::Global(decoder.read_plain(trail)?)),
        }
    }
}

impl<A: Allocator> Decodable<A> for Import<A> {
    const CONTEXT: Context = Context::Import;

    fn decode<S: Stream>(
        decoder: &mut Decoder<S>,
        trail: &mut Trail,
        alloc: &A,
    ) -> Result<Self, Error<S>> {
        Ok(Self {
            module: decoder.read(trail, alloc)?,
            name: decoder.read(trail, alloc)?,
            desc: decoder.read_plain(trail)?,
        })
    }
}

#[derive(Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
enum ExportKind {
    Function = 0x00,
    Table = 0x01,
    Memory = 0x02,
    Global = 0x03,
}

impl Scalar for ExportDesc {
    const CONTEXT: Context = Context::ExportDesc;

    fn decode<S: Stream>(decoder: &mut Decoder<S>, trail: &mut Trail) -> Result<Self, Error<S>> {
        match decoder.read_plain(trail)? {
            ExportKind::Function => Ok(Self::Function(decoder.read_plain(trail)?)),
            ExportKind::Table => Ok(Self::Table(decoder.read_plain(trail)?)),
            ExportKind::Memory => Ok(Self::Memory(decoder.read_plain(trail)?)),
            ExportKind::Global => Ok(Self::Global(decoder.read_plain(trail)?)),
        }
    }
}

impl<A: Allocator> Decodable<A> for Export<A> {
    const CONTEXT: Context = Context::Export;

    fn decode<S: Stream>(
        decoder: &mut Decoder<S>,
        trail: &mut Trail,
        alloc: &A,
    ) -> Result<Self, Error<S>> {
        Ok(Self {
            name: decoder.read(trail, alloc)?,
            desc: decoder.read_plain(trail)?,
        })
    }
}

impl<A: Allocator> Decodable<A> for Global<A> {
    const CONTEXT: Context = Context::Global;

    fn decode<S: Stream>(
        decoder: &mut Decoder<S>,
        trail: &mut Trail,
        alloc: &A,
    ) -> Result<Self, Error<S>> {
        Ok(Self {
            ty: decoder.read_plain(trail)?,
            init: decoder.read(trail, alloc)?,
        })
    }
}

impl<A: Allocator> Decodable<A> for Element<A> {
    const CONTEXT: Context = Context::Elem;

    fn decode<S: Stream>(
        decoder: &mut Decoder<S>,
        trail: &mut Trail,
        alloc: &A,
    ) -> Result<Self, Error<S>> {
        Ok(Self {
            table: decoder.read_plain(trail)?,
            offset: decoder.read(trail, alloc)?,
            init: decoder.read(trail, alloc)?,
        })
    }
}

impl<A: Allocator> Decodable<A> for Data<A> {
    const CONTEXT: Context = Context::Data;

    fn decode<S: Stream>(
        decoder: &mut Decoder<S>,
        trail: &mut Trail,
        alloc: &A,
    ) -> Result<Self, Error<S>> {
        Ok(Self {
            memory: decoder.read_plain(trail)?,
            offset: decoder.read(trail, alloc)?,
            init: decoder.read(trail, alloc)?,
        })
    }
}

// One code-section entry: the run-length locals list and the body, framed
// by a declared byte size that must match what they consume.
pub(super) struct CodeEntry<A: Allocator> {
    pub(super) locals: Vec<ValType, A>,
    pub(super) body: Expression<A>,
}

impl<A: Allocator> Decodable<A> for CodeEntry<A> {
    const CONTEXT: Context = Context::Code;

    fn decode<S: Stream>(
        decoder: &mut Decoder<S>,
        trail: &mut Trail,
        alloc: &A,
    ) -> Result<Self, Error<S>> {
        let declared: u32 = decoder.read_plain(trail)?;
        let start = decoder.position();
        let locals = decode_locals(decoder, trail, alloc)?;
        let body = decoder.read(trail, alloc)?;
        let actual = decoder.position() - start;
        if actual != declared as usize {
            return Err(Error::InvalidSectionSize {
                declared,
                actual: actual as u32,
                position: decoder.position(),
            });
        }
        Ok(Self { locals, body })
    }
}

// Expands `vec((count, type))` into the flat locals list it denotes.
fn decode_locals<S: Stream, A: Allocator>(
    decoder: &mut Decoder<S>,
    trail: &mut Trail,
    alloc: &A,
) -> Result<Vec<ValType, A>, Error<S>> {
    decoder.in_context(trail, Context::Locals, |decoder, trail| {
        let groups: u32 = decoder.read_plain(trail)?;
        let mut locals = Vec::new_in(alloc.clone());
        for _ in 0..groups {
            let count: u32 = decoder.read_plain(trail)?;
            let ty: ValType = decoder.read_plain(trail)?;
            let total = locals.len() + count as usize;
            if total > MAX_FUNCTION_LOCALS {
                return Err(Error::TooManyLocals(total));
            }
            locals.try_reserve_exact(count as usize)?;
            locals.resize(total, ty);
        }
        Ok(locals)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::compat::alloc::Global;
    use crate::stream::Bytes;

    fn decoder(bytes: &[u8]) -> Decoder<Bytes<&[u8]>> {
        Decoder::new(Bytes::new(bytes))
    }

    fn plain<T: Scalar>(bytes: &[u8]) -> Result<T, Error<Bytes<&[u8]>>> {
        decoder(bytes).read_plain(&mut Trail::new())
    }

    #[test]
    fn value_type_tags() {
        assert_eq!(plain::<ValType>(&[0x7f]).unwrap(), ValType::I32);
        assert_eq!(plain::<ValType>(&[0x7e]).unwrap(), ValType::I64);
        assert_eq!(plain::<ValType>(&[0x7d]).unwrap(), ValType::F32);
        assert_eq!(plain::<ValType>(&[0x7c]).unwrap(), ValType::F64);
        // 0x7b is the post-MVP v128 tag.
        assert!(matches!(
            plain::<ValType>(&[0x7b]),
            Err(Error::Unexpected {
                found: 0x7b,
                expected: None,
            })
        ));
    }

    #[test]
    fn limits_forms() {
        assert_eq!(
            plain::<Limits>(&[0x00, 0x05]).unwrap(),
            Limits { min: 5, max: None }
        );
        assert_eq!(
            plain::<Limits>(&[0x01, 0x05, 0x80, 0x01]).unwrap(),
            Limits {
                min: 5,
                max: Some(128),
            }
        );
        assert!(matches!(
            plain::<Limits>(&[0x02, 0x05]),
            Err(Error::Unexpected { found: 0x02, .. })
        ));
        assert!(matches!(plain::<Limits>(&[0x01, 0x05]), Err(Error::UnexpectedEnd)));
    }

    #[test]
    fn table_and_memory_types() {
        assert_eq!(
            plain::<TableType>(&[0x70, 0x00, 0x00]).unwrap(),
            TableType {
                element: ElemType::Funcref,
                limits: Limits { min: 0, max: None },
            }
        );
        // Only funcref may populate MVP tables.
        assert!(matches!(
            plain::<TableType>(&[0x6f, 0x00, 0x00]),
            Err(Error::Unexpected { found: 0x6f, .. })
        ));
        assert_eq!(
            plain::<MemoryType>(&[0x01, 0x01, 0x10]).unwrap(),
            MemoryType {
                limits: Limits {
                    min: 1,
                    max: Some(16),
                },
            }
        );
    }

    #[test]
    fn global_type_reads_value_then_mutability() {
        assert_eq!(
            plain::<GlobalType>(&[0x7d, 0x00]).unwrap(),
            GlobalType {
                mutability: Mutability::Const,
                value: ValType::F32,
            }
        );
        assert_eq!(
            plain::<GlobalType>(&[0x7f, 0x01]).unwrap(),
            GlobalType {
                mutability: Mutability::Var,
                value: ValType::I32,
            }
        );
        assert!(matches!(
            plain::<GlobalType>(&[0x7f, 0x02]),
            Err(Error::Unexpected { found: 0x02, .. })
        ));
    }

    #[test]
    fn block_types() {
        assert_eq!(plain::<BlockType>(&[0x40]).unwrap(), BlockType::Empty);
        assert_eq!(
            plain::<BlockType>(&[0x7e]).unwrap(),
            BlockType::Value(ValType::I64)
        );
        assert!(matches!(
            plain::<BlockType>(&[0x41]),
            Err(Error::Unexpected { found: 0x41, .. })
        ));
    }

    #[test]
    fn memarg_reads_align_then_offset() {
        assert_eq!(
            plain::<MemArg>(&[0x03, 0x80, 0x02]).unwrap(),
            MemArg {
                align: 3,
                offset: 256,
            }
        );
    }

    #[test]
    fn descriptor_kind_tags_are_closed_sets() {
        assert!(matches!(
            plain::<ImportDesc>(&[0x04, 0x00]),
            Err(Error::Unexpected { found: 0x04, .. })
        ));
        assert!(matches!(
            plain::<ExportDesc>(&[0x04, 0x00]),
            Err(Error::Unexpected { found: 0x04, .. })
        ));
        assert!(matches!(
            plain::<ExportDesc>(&[0x03, 0x07]),
            Ok(ExportDesc::Global(GlobalIdx(7)))
        ));
    }

    #[test]
    fn locals_cap_counts_across_groups() {
        // Two groups of 30_000 together exceed the cap even though neither
        // does alone.
        let mut bytes = vec![0x02];
        for _ in 0..2 {
            bytes.extend([0xb0, 0xea, 0x01]); // 30_000
            bytes.push(0x7f);
        }
        let mut d = decoder(&bytes);
        let result = decode_locals(&mut d, &mut Trail::new(), &Global);
        assert!(matches!(result, Err(Error::TooManyLocals(60_000))));
    }
}
