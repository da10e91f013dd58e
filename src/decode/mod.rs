// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! WebAssembly binary-format decoding.
//!
//! [`decode_module`] consumes a [`Stream`] positioned at a module's magic
//! preamble and yields a [`Module`]. Decoding is strict and fatal-on-error:
//! the first violation of the grammar is reported (with a trail of what was
//! being decoded, for diagnostics) and no partial module is observable.

mod expr;
mod grammar;
mod leb128;

use grammar::CodeEntry;

use core::fmt;

use crate::Allocator;
use crate::compat::alloc::TryReserveError;
use crate::compat::vec::Vec;
use crate::stream::{Bytes, Stream};
use crate::types::*;

use leb128::Varint;

// The number of grammar frames retained for diagnostics. Deeper frames
// (e.g. from heavily nested expressions) are simply not recorded; decoding
// itself is not depth-limited.
const TRAIL_DEPTH: usize = 8;

// What the decoder was in the middle of when an error surfaced. Names
// follow the grammar productions of the binary format.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Context {
    Preamble,
    Section,
    Custom,
    TypeSec,
    ImportSec,
    FuncSec,
    TableSec,
    MemorySec,
    GlobalSec,
    ExportSec,
    StartSec,
    ElemSec,
    CodeSec,
    DataSec,
    FuncType,
    ValType,
    BlockType,
    Limits,
    TableType,
    MemType,
    GlobalType,
    Mut,
    Import,
    ImportDesc,
    Export,
    ExportDesc,
    Global,
    Elem,
    Data,
    Code,
    Locals,
    Name,
    Expr,
    Opcode,
    MemArg,
    BrTableOperands,
    TypeIdx,
    FuncIdx,
    TableIdx,
    MemIdx,
    GlobalIdx,
    LocalIdx,
    LabelIdx,
    ElemType,
    Byte,
    U32,
    I32,
    I64,
    F32,
    F64,
    Vec,
    RawBytes,
}

impl Context {
    fn name(self) -> &'static str {
        match self {
            Context::Preamble => "preamble",
            Context::Section => "section ID",
            Context::Custom => "customsec",
            Context::TypeSec => "typesec",
            Context::ImportSec => "importsec",
            Context::FuncSec => "funcsec",
            Context::TableSec => "tablesec",
            Context::MemorySec => "memsec",
            Context::GlobalSec => "globalsec",
            Context::ExportSec => "exportsec",
            Context::StartSec => "startsec",
            Context::ElemSec => "elemsec",
            Context::CodeSec => "codesec",
            Context::DataSec => "datasec",
            Context::FuncType => "functype",
            Context::ValType => "valtype",
            Context::BlockType => "blocktype",
            Context::Limits => "limits",
            Context::TableType => "tabletype",
            Context::MemType => "memtype",
            Context::GlobalType => "globaltype",
            Context::Mut => "mut",
            Context::Import => "import",
            Context::ImportDesc => "importdesc",
            Context::Export => "export",
            Context::ExportDesc => "exportdesc",
            Context::Global => "global",
            Context::Elem => "elem",
            Context::Data => "data",
            Context::Code => "code",
            Context::Locals => "locals",
            Context::Name => "name",
            Context::Expr => "expr",
            Context::Opcode => "opcode",
            Context::MemArg => "memarg",
            Context::BrTableOperands => "br_table operands",
            Context::TypeIdx => "typeidx",
            Context::FuncIdx => "funcidx",
            Context::TableIdx => "tableidx",
            Context::MemIdx => "memidx",
            Context::GlobalIdx => "globalidx",
            Context::LocalIdx => "localidx",
            Context::LabelIdx => "labelidx",
            Context::ElemType => "elemtype",
            Context::Byte => "byte",
            Context::U32 => "u32",
            Context::I32 => "i32",
            Context::I64 => "i64",
            Context::F32 => "f32",
            Context::F64 => "f64",
            Context::Vec => "vec",
            Context::RawBytes => "raw bytes",
        }
    }
}

/// The trail of grammar productions that were in flight when decoding
/// failed, outermost first, each with the byte offset where it began.
#[derive(Clone, Debug)]
pub struct Trail {
    contexts: [Context; TRAIL_DEPTH],
    offsets: [usize; TRAIL_DEPTH],
    depth: u8,
}

impl Trail {
    fn new() -> Self {
        Self {
            contexts: [Context::Preamble; TRAIL_DEPTH],
            offsets: [0; TRAIL_DEPTH],
            depth: 0,
        }
    }

    // Records a frame, returning whether it was retained. Past TRAIL_DEPTH
    // the trail saturates: inner frames go unrecorded but decoding proceeds.
    fn push(&mut self, context: Context, offset: usize) -> bool {
        let depth = usize::from(self.depth);
        if depth >= TRAIL_DEPTH {
            return false;
        }
        self.contexts[depth] = context;
        self.offsets[depth] = offset;
        self.depth += 1;
        true
    }

    fn pop(&mut self) {
        debug_assert!(self.depth > 0);
        self.depth -= 1;
    }

    fn frames(&self) -> impl Iterator<Item = (Context, usize)> + '_ {
        self.contexts
            .iter()
            .zip(&self.offsets)
            .take(usize::from(self.depth))
            .map(|(&context, &offset)| (context, offset))
    }
}

/// Errors that can arise while decoding a module.
pub enum Error<S: Stream> {
    /// Fallible allocation failed while building the module.
    Alloc,
    /// The function and code sections disagree on how many functions the
    /// module defines (including the case where only one is present).
    FunctionCodeMismatch { functions: u32, bodies: u32 },
    /// A section or code-entry body consumed a different number of bytes
    /// than its envelope declared.
    InvalidSectionSize {
        declared: u32,
        actual: u32,
        position: usize,
    },
    /// A name is not valid UTF-8; `valid_up_to` is the length of its valid
    /// prefix.
    InvalidUnicode { valid_up_to: usize },
    /// Non-custom section ids must appear in strictly increasing order, at
    /// most once each.
    SectionOrder { seen: SectionId, current: SectionId },
    /// The underlying stream failed for a reason other than running out of
    /// bytes.
    Stream(S::Error),
    /// A function expands to more local variables than the implementation
    /// supports.
    TooManyLocals(usize),
    /// A byte outside the allowed set: a bad tag, an unknown opcode, a
    /// reserved byte that was not zero, or a LEB128 group overflowing its
    /// width. `expected` is populated when exactly one byte was acceptable.
    Unexpected { found: u8, expected: Option<u8> },
    /// The stream ended before a required byte.
    UnexpectedEnd,
}

impl<S: Stream> Error<S> {
    fn from_stream(err: S::Error) -> Self {
        if S::is_eof(&err) {
            Error::UnexpectedEnd
        } else {
            Error::Stream(err)
        }
    }
}

impl<S: Stream> fmt::Debug for Error<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Alloc => write!(f, "allocation failure"),
            Error::FunctionCodeMismatch { functions, bodies } => write!(
                f,
                "function section declares {functions} functions but the code section holds {bodies} bodies"
            ),
            Error::InvalidSectionSize {
                declared,
                actual,
                position,
            } => write!(
                f,
                "declared size {declared:#x} but consumed {actual:#x} (at offset {position:#x})"
            ),
            Error::InvalidUnicode { valid_up_to } => {
                write!(f, "name is not UTF-8 (valid up to byte {valid_up_to})")
            }
            Error::SectionOrder { seen, current } => {
                write!(f, "section ({current:?}) cannot follow section ({seen:?})")
            }
            Error::Stream(err) => write!(f, "{err:?}"),
            Error::TooManyLocals(count) => {
                write!(f, "too many locals: at least {count} were declared")
            }
            Error::Unexpected {
                found,
                expected: Some(expected),
            } => write!(f, "unexpected byte {found:#04x} (wanted {expected:#04x})"),
            Error::Unexpected {
                found,
                expected: None,
            } => write!(f, "unexpected byte {found:#04x}"),
            Error::UnexpectedEnd => write!(f, "unexpected end of input"),
        }
    }
}

impl<S: Stream> leb128::Error for Error<S> {
    fn value_out_of_range(found: u8) -> Self {
        Error::Unexpected {
            found,
            expected: None,
        }
    }
}

impl<S: Stream> From<TryReserveError> for Error<S> {
    fn from(_: TryReserveError) -> Self {
        Error::Alloc
    }
}

/// A decode error together with the trail of grammar productions that were
/// being decoded when it surfaced.
pub struct TracedError<S: Stream> {
    pub error: Error<S>,
    pub trail: Trail,
}

impl<S: Stream> fmt::Debug for TracedError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.error)?;
        for (i, (context, offset)) in self.trail.frames().enumerate() {
            write!(f, "\n{offset:#x}: ")?;
            for _ in 0..i {
                write!(f, "  ")?;
            }
            write!(f, "{}", context.name())?;
        }
        Ok(())
    }
}

// The stream wrapper everything decodes through: primitive consumption with
// EOF folding, plus trail bookkeeping.
pub(crate) struct Decoder<S: Stream> {
    stream: S,
}

impl<S: Stream> Decoder<S> {
    fn new(stream: S) -> Self {
        Self { stream }
    }

    pub(crate) fn position(&mut self) -> usize {
        self.stream.position()
    }

    // Whether the stream is cleanly exhausted (used only at section
    // boundaries; there is no in-band end-of-module marker).
    fn at_end(&mut self) -> Result<bool, Error<S>> {
        Ok(self.stream.peek().map_err(Error::Stream)?.is_none())
    }

    pub(crate) fn consume(&mut self) -> Result<u8, Error<S>> {
        self.stream.read_byte().map_err(Error::from_stream)
    }

    pub(crate) fn consume_expected(&mut self, expected: u8) -> Result<(), Error<S>> {
        let found = self.consume()?;
        if found == expected {
            Ok(())
        } else {
            Err(Error::Unexpected {
                found,
                expected: Some(expected),
            })
        }
    }

    pub(crate) fn read_exact_raw(&mut self, buf: &mut [u8]) -> Result<(), Error<S>> {
        self.stream.read_exact(buf).map_err(Error::from_stream)
    }

    pub(crate) fn read_varint<T: Varint>(&mut self) -> Result<T, Error<S>> {
        leb128::read(|| self.consume())
    }

    // Runs `f` under a trail frame, unwinding the frame on success so that
    // a later error reports only what was actually in flight.
    pub(crate) fn in_context<F, R>(
        &mut self,
        trail: &mut Trail,
        context: Context,
        f: F,
    ) -> Result<R, Error<S>>
    where
        F: FnOnce(&mut Self, &mut Trail) -> Result<R, Error<S>>,
    {
        let pushed = trail.push(context, self.position());
        let result = f(self, trail);
        if pushed && result.is_ok() {
            trail.pop();
        }
        result
    }

    pub(crate) fn read<A: Allocator, T: Decodable<A>>(
        &mut self,
        trail: &mut Trail,
        alloc: &A,
    ) -> Result<T, Error<S>> {
        self.in_context(trail, T::CONTEXT, |decoder, trail| {
            T::decode(decoder, trail, alloc)
        })
    }

    pub(crate) fn read_plain<T: Scalar>(&mut self, trail: &mut Trail) -> Result<T, Error<S>> {
        self.in_context(trail, T::CONTEXT, |decoder, trail| T::decode(decoder, trail))
    }

    // Like `read`, but under an explicit context (e.g. the section being
    // decoded rather than the generic shape of its contents).
    fn read_in<A: Allocator, T: Decodable<A>>(
        &mut self,
        trail: &mut Trail,
        context: Context,
        alloc: &A,
    ) -> Result<T, Error<S>> {
        self.in_context(trail, context, |decoder, trail| {
            T::decode(decoder, trail, alloc)
        })
    }

    pub(crate) fn read_bytes<A: Allocator>(
        &mut self,
        trail: &mut Trail,
        count: usize,
        alloc: &A,
    ) -> Result<Vec<u8, A>, Error<S>> {
        self.in_context(trail, Context::RawBytes, |decoder, _| {
            let mut buf = Vec::new_in(alloc.clone());
            buf.try_reserve_exact(count)?;
            buf.resize(count, 0);
            decoder.read_exact_raw(&mut buf)?;
            Ok(buf)
        })
    }

    fn skip(&mut self, trail: &mut Trail, count: usize) -> Result<(), Error<S>> {
        self.in_context(trail, Context::RawBytes, |decoder, _| {
            decoder.stream.skip(count).map_err(Error::from_stream)
        })
    }

    // The fixed eight-byte preamble: `\0asm` then version 1, little endian.
    fn expect_preamble(&mut self, trail: &mut Trail) -> Result<(), Error<S>> {
        const PREAMBLE: [u8; 8] = [0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

        self.in_context(trail, Context::Preamble, |decoder, _| {
            for byte in PREAMBLE {
                decoder.consume_expected(byte)?;
            }
            Ok(())
        })
    }
}

// Types decodable from the stream, given an allocator for their storage.
pub(crate) trait Decodable<A: Allocator>: Sized {
    const CONTEXT: Context;

    fn decode<S: Stream>(
        decoder: &mut Decoder<S>,
        trail: &mut Trail,
        alloc: &A,
    ) -> Result<Self, Error<S>>;
}

// Fixed-size types decodable without allocating.
pub(crate) trait Scalar: Sized + Copy {
    const CONTEXT: Context;

    fn decode<S: Stream>(decoder: &mut Decoder<S>, trail: &mut Trail) -> Result<Self, Error<S>>;
}

impl<T: Scalar, A: Allocator> Decodable<A> for T {
    const CONTEXT: Context = <T as Scalar>::CONTEXT;

    fn decode<S: Stream>(
        decoder: &mut Decoder<S>,
        trail: &mut Trail,
        _: &A,
    ) -> Result<Self, Error<S>> {
        <Self as Scalar>::decode(decoder, trail)
    }
}

/// Receives custom sections as they are encountered during decoding.
///
/// Custom sections may appear anywhere between (or around) the standard
/// sections; their payloads are opaque. A sink that returns `false` from
/// [`CustomSectionSink::wants`] never pays for the payload bytes — the
/// decoder skips them.
pub trait CustomSectionSink<A: Allocator> {
    /// Whether the payload of the custom section with this name should be
    /// read and delivered.
    fn wants(&self, name: &str) -> bool;

    /// Receives a custom section. Called only if `wants` returned `true`
    /// for its name.
    fn accept(&mut self, section: CustomSection<A>);
}

/// Drops every custom section unread.
pub struct DiscardCustomSections;

impl<A: Allocator> CustomSectionSink<A> for DiscardCustomSections {
    fn wants(&self, _: &str) -> bool {
        false
    }

    fn accept(&mut self, _: CustomSection<A>) {}
}

/// Decodes a module from `stream`, routing custom sections through `sink`
/// and allocating all decoded storage from `alloc`.
pub fn decode_module<S, C, A>(stream: S, sink: &mut C, alloc: A) -> Result<Module<A>, TracedError<S>>
where
    S: Stream,
    C: CustomSectionSink<A>,
    A: Allocator,
{
    let mut trail = Trail::new();
    let mut decoder = Decoder::new(stream);
    match run(&mut decoder, &mut trail, sink, alloc) {
        Ok(module) => Ok(module),
        Err(error) => Err(TracedError { error, trail }),
    }
}

fn run<S, C, A>(
    decoder: &mut Decoder<S>,
    trail: &mut Trail,
    sink: &mut C,
    alloc: A,
) -> Result<Module<A>, Error<S>>
where
    S: Stream,
    C: CustomSectionSink<A>,
    A: Allocator,
{
    decoder.expect_preamble(trail)?;

    let mut types: Vec<FunctionType<A>, A> = Vec::new_in(alloc.clone());
    let mut imports: Vec<Import<A>, A> = Vec::new_in(alloc.clone());
    let mut func_types: Vec<TypeIdx, A> = Vec::new_in(alloc.clone());
    let mut tables: Vec<TableType, A> = Vec::new_in(alloc.clone());
    let mut memories: Vec<MemoryType, A> = Vec::new_in(alloc.clone());
    let mut globals: Vec<Global<A>, A> = Vec::new_in(alloc.clone());
    let mut exports: Vec<Export<A>, A> = Vec::new_in(alloc.clone());
    let mut start: Option<FuncIdx> = None;
    let mut elems: Vec<Element<A>, A> = Vec::new_in(alloc.clone());
    let mut bodies: Vec<CodeEntry<A>, A> = Vec::new_in(alloc.clone());
    let mut datas: Vec<Data<A>, A> = Vec::new_in(alloc.clone());

    // The id of the last non-custom section, for the ordering check. The
    // loop is driven by the peeked byte: the format has no end-of-module
    // marker, so a clean EOF at a section boundary is the terminator.
    let mut last: Option<SectionId> = None;
    while !decoder.at_end()? {
        let id: SectionId = decoder.read_plain(trail)?;
        if id != SectionId::Custom {
            if let Some(seen) = last
                && seen >= id
            {
                return Err(Error::SectionOrder { seen, current: id });
            }
            last = Some(id);
        }

        let declared: u32 = decoder.read_plain(trail)?;
        let body_start = decoder.position();
        match id {
            SectionId::Custom => {
                let name: Name<A> = decoder.read_in(trail, Context::Custom, &alloc)?;
                let consumed = decoder.position() - body_start;
                // The name must fit in the declared size; an empty payload
                // after it is legitimate.
                if consumed > declared as usize {
                    return Err(Error::InvalidSectionSize {
                        declared,
                        actual: consumed as u32,
                        position: decoder.position(),
                    });
                }
                let payload = declared as usize - consumed;
                if sink.wants(name.as_str()) {
                    let bytes = decoder.read_bytes(trail, payload, &alloc)?;
                    sink.accept(CustomSection { name, bytes });
                } else {
                    decoder.skip(trail, payload)?;
                }
            }
            SectionId::Type => types = decoder.read_in(trail, Context::TypeSec, &alloc)?,
            SectionId::Import => imports = decoder.read_in(trail, Context::ImportSec, &alloc)?,
            SectionId::Function => {
                func_types = decoder.read_in(trail, Context::FuncSec, &alloc)?;
            }
            SectionId::Table => tables = decoder.read_in(trail, Context::TableSec, &alloc)?,
            SectionId::Memory => memories = decoder.read_in(trail, Context::MemorySec, &alloc)?,
            SectionId::Global => globals = decoder.read_in(trail, Context::GlobalSec, &alloc)?,
            SectionId::Export => exports = decoder.read_in(trail, Context::ExportSec, &alloc)?,
            SectionId::Start => start = Some(decoder.read_in(trail, Context::StartSec, &alloc)?),
            SectionId::Element => elems = decoder.read_in(trail, Context::ElemSec, &alloc)?,
            SectionId::Code => bodies = decoder.read_in(trail, Context::CodeSec, &alloc)?,
            SectionId::Data => datas = decoder.read_in(trail, Context::DataSec, &alloc)?,
        }

        let actual = decoder.position() - body_start;
        if actual != declared as usize {
            return Err(Error::InvalidSectionSize {
                declared,
                actual: actual as u32,
                position: decoder.position(),
            });
        }
    }

    // Zip the function section's type indices with the code section's
    // bodies; each declares one half of every module-defined function.
    if func_types.len() != bodies.len() {
        return Err(Error::FunctionCodeMismatch {
            functions: func_types.len() as u32,
            bodies: bodies.len() as u32,
        });
    }
    let mut funcs: Vec<Function<A>, A> = Vec::new_in(alloc.clone());
    funcs.try_reserve_exact(bodies.len())?;
    for (ty, entry) in func_types.into_iter().zip(bodies) {
        funcs.push(Function {
            ty,
            locals: entry.locals,
            body: entry.body,
        });
    }

    Ok(Module {
        types,
        imports,
        funcs,
        tables,
        memories,
        globals,
        exports,
        start,
        elems,
        datas,
    })
}

impl<A: Allocator> Module<A> {
    /// Decodes a module from an in-memory buffer, discarding custom
    /// sections.
    pub fn decode_in<B: AsRef<[u8]>>(bytes: B, alloc: A) -> Result<Self, TracedError<Bytes<B>>> {
        decode_module(Bytes::new(bytes), &mut DiscardCustomSections, alloc)
    }
}

impl Module<crate::compat::alloc::Global> {
    /// Decodes a module from an in-memory buffer with the global allocator,
    /// discarding custom sections.
    pub fn decode<B: AsRef<[u8]>>(bytes: B) -> Result<Self, TracedError<Bytes<B>>> {
        Self::decode_in(bytes, crate::compat::alloc::Global)
    }
}
