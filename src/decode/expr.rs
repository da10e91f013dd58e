// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Expression decoding.
//!
//! An expression is an instruction sequence closed by the `end`
//! pseudo-opcode; the then-arm of an `if` may instead be closed by `else`,
//! which hands the decoder over to the else-arm. The terminators are
//! consumed here and never emitted: decoded instruction lists contain only
//! real instructions, with block/loop/if bodies nested inside their
//! variants rather than flattened alongside them.

use crate::Allocator;
use crate::compat::vec::Vec;
use crate::stream::Stream;
use crate::types::*;

use super::{Context, Decodable, Decoder, Error, Trail};

// Which pseudo-opcode closed an instruction sequence.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Terminator {
    End,
    Else,
}

impl<A: Allocator> Decodable<A> for Expression<A> {
    const CONTEXT: Context = Context::Expr;

    fn decode<S: Stream>(
        decoder: &mut Decoder<S>,
        trail: &mut Trail,
        alloc: &A,
    ) -> Result<Self, Error<S>> {
        // Outside an `if` then-arm only `end` may close the sequence;
        // `sequence` rejects a stray `else` for us.
        let (expression, _) = sequence(decoder, trail, alloc, false)?;
        Ok(expression)
    }
}

// Decodes a nested body under its own trail frame.
fn nested<S: Stream, A: Allocator>(
    decoder: &mut Decoder<S>,
    trail: &mut Trail,
    alloc: &A,
    in_then_arm: bool,
) -> Result<(Expression<A>, Terminator), Error<S>> {
    decoder.in_context(trail, Context::Expr, |decoder, trail| {
        sequence(decoder, trail, alloc, in_then_arm)
    })
}

fn sequence<S: Stream, A: Allocator>(
    decoder: &mut Decoder<S>,
    trail: &mut Trail,
    alloc: &A,
    in_then_arm: bool,
) -> Result<(Expression<A>, Terminator), Error<S>> {
    let mut instructions = Vec::new_in(alloc.clone());
    loop {
        let op: Opcode = decoder.read_plain(trail)?;
        let instruction = match op {
            Opcode::End => return Ok((Expression(instructions), Terminator::End)),
            Opcode::Else => {
                if in_then_arm {
                    return Ok((Expression(instructions), Terminator::Else));
                }
                return Err(Error::Unexpected {
                    found: Opcode::Else as u8,
                    expected: None,
                });
            }

            Opcode::Block => {
                let ty: BlockType = decoder.read_plain(trail)?;
                let (body, _) = nested(decoder, trail, alloc, false)?;
                Instruction::Block { ty, body }
            }
            Opcode::Loop => {
                let ty: BlockType = decoder.read_plain(trail)?;
                let (body, _) = nested(decoder, trail, alloc, false)?;
                Instruction::Loop { ty, body }
            }
            Opcode::If => {
                let ty: BlockType = decoder.read_plain(trail)?;
                let (then, terminator) = nested(decoder, trail, alloc, true)?;
                let otherwise = match terminator {
                    Terminator::Else => nested(decoder, trail, alloc, false)?.0,
                    Terminator::End => Expression::empty_in(alloc.clone()),
                };
                Instruction::If {
                    ty,
                    then,
                    otherwise,
                }
            }

            Opcode::Br => Instruction::Br(decoder.read_plain(trail)?),
            Opcode::BrIf => Instruction::BrIf(decoder.read_plain(trail)?),
            Opcode::BrTable => {
                decoder.in_context(trail, Context::BrTableOperands, |decoder, trail| {
                    Ok(Instruction::BrTable {
                        targets: decoder.read(trail, alloc)?,
                        default: decoder.read_plain(trail)?,
                    })
                })?
            }
            Opcode::Call => Instruction::Call(decoder.read_plain(trail)?),
            Opcode::CallIndirect => {
                let ty: TypeIdx = decoder.read_plain(trail)?;
                decoder.consume_expected(0x00)?;
                Instruction::CallIndirect(ty)
            }

            Opcode::LocalGet => Instruction::LocalGet(decoder.read_plain(trail)?),
            Opcode::LocalSet => Instruction::LocalSet(decoder.read_plain(trail)?),
            Opcode::LocalTee => Instruction::LocalTee(decoder.read_plain(trail)?),
            Opcode::GlobalGet => Instruction::GlobalGet(decoder.read_plain(trail)?),
            Opcode::GlobalSet => Instruction::GlobalSet(decoder.read_plain(trail)?),

            Opcode::MemorySize => {
                decoder.consume_expected(0x00)?;
                Instruction::MemorySize
            }
            Opcode::MemoryGrow => {
                decoder.consume_expected(0x00)?;
                Instruction::MemoryGrow
            }

            Opcode::I32Const => Instruction::I32Const(decoder.read_plain(trail)?),
            Opcode::I64Const => Instruction::I64Const(decoder.read_plain(trail)?),
            Opcode::F32Const => Instruction::F32Const(decoder.read_plain(trail)?),
            Opcode::F64Const => Instruction::F64Const(decoder.read_plain(trail)?),

            op => {
                if let Some(instruction) = Instruction::from_immediate_free(op) {
                    instruction
                } else {
                    // Everything else in the opcode table is a load or a
                    // store carrying a memory operand.
                    let arg: MemArg = decoder.read_plain(trail)?;
                    Instruction::from_memory_access(op, arg).ok_or(Error::Unexpected {
                        found: op as u8,
                        expected: None,
                    })?
                }
            }
        };
        instructions.try_reserve(1)?;
        instructions.push(instruction);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::compat::alloc::Global;
    use crate::stream::Bytes;

    fn decode(bytes: &[u8]) -> Result<Expression<Global>, Error<Bytes<&[u8]>>> {
        let mut decoder = Decoder::new(Bytes::new(bytes));
        decoder.read(&mut Trail::new(), &Global)
    }

    #[test]
    fn empty_expression_is_just_end() {
        let expression = decode(&[0x0b]).unwrap();
        assert!(expression.is_empty());
    }

    #[test]
    fn terminators_never_appear_in_the_output() {
        let expression = decode(&[
            0x02, 0x40, // block
            0x03, 0x40, // loop
            0x04, 0x40, // if
            0x05, // else
            0x0b, // end (if)
            0x0b, // end (loop)
            0x0b, // end (block)
            0x0b, // end (expression)
        ])
        .unwrap();
        // One instruction at each level; the terminators were consumed as
        // structure.
        assert_eq!(expression.len(), 1);
        let Instruction::Block { body, .. } = &expression[0] else {
            panic!("expected a block");
        };
        assert_eq!(body.len(), 1);
        let Instruction::Loop { body, .. } = &body[0] else {
            panic!("expected a loop");
        };
        assert_eq!(body.len(), 1);
        let Instruction::If {
            then, otherwise, ..
        } = &body[0]
        else {
            panic!("expected an if");
        };
        assert!(then.is_empty());
        assert!(otherwise.is_empty());
    }

    #[test]
    fn missing_end_is_unexpected_end() {
        assert!(matches!(decode(&[0x01, 0x01]), Err(Error::UnexpectedEnd)));
        assert!(matches!(decode(&[0x02, 0x40, 0x0b]), Err(Error::UnexpectedEnd)));
    }

    #[test]
    fn else_outside_an_if_is_rejected() {
        assert!(matches!(
            decode(&[0x05, 0x0b]),
            Err(Error::Unexpected {
                found: 0x05,
                expected: None,
            })
        ));
        // Also inside a block, which is not an if arm.
        assert!(matches!(
            decode(&[0x02, 0x40, 0x05, 0x0b, 0x0b]),
            Err(Error::Unexpected { found: 0x05, .. })
        ));
    }

    #[test]
    fn constants_carry_their_literals() {
        let expression = decode(&[
            0x41, 0x7f, // i32.const -1
            0x42, 0xc8, 0x01, // i64.const 200
            0x43, 0x00, 0x00, 0x80, 0xbf, // f32.const -1.0
            0x44, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xf0, 0x3f, // f64.const 1.0
            0x0b,
        ])
        .unwrap();
        assert!(matches!(expression[0], Instruction::I32Const(-1)));
        assert!(matches!(expression[1], Instruction::I64Const(200)));
        assert!(matches!(expression[2], Instruction::F32Const(v) if v == -1.0));
        assert!(matches!(expression[3], Instruction::F64Const(v) if v == 1.0));
    }

    #[test]
    fn deep_nesting_decodes_without_trail_overflow() {
        // 64 nested blocks, far past the recorded trail depth.
        let mut bytes = std::vec::Vec::new();
        for _ in 0..64 {
            bytes.extend([0x02, 0x40]);
        }
        bytes.resize(bytes.len() + 65, 0x0b);
        let expression = decode(&bytes).unwrap();
        assert_eq!(expression.len(), 1);
    }
}
