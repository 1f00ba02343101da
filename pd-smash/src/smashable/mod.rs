//! Smashable control-flow sequences.
//!
//! A smashable sequence is a fixed-shape group of instructions that embeds
//! exactly one pointer-width data word (the slot). The slot is the only part
//! that changes after emission, and it is always naturally aligned, so a
//! single atomic store retargets the sequence while other threads may be
//! executing it.
//!
//! Backends implement [`SmashableBackend`]. Raw-address decoders and
//! patchers are `unsafe`; [`CodeBuffer`] offers bounds-checked wrappers on
//! top of the default backend.

mod aarch64;

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use crate::address::CodeAddress;
use crate::code_buffer::CodeBuffer;
use crate::error::{SmashError, SmashResult};

pub use aarch64::AArch64;

pub type DefaultBackend = AArch64;

/// Width and required alignment of an embedded slot.
pub const SLOT_SIZE: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SmashKind {
    Call,
    Jmp,
    Jcc,
    Movq,
    Cmpq,
}

impl SmashKind {
    pub fn name(self) -> &'static str {
        match self {
            SmashKind::Call => "call",
            SmashKind::Jmp => "jmp",
            SmashKind::Jcc => "jcc",
            SmashKind::Movq => "movq",
            SmashKind::Cmpq => "cmpq",
        }
    }
}

impl std::fmt::Display for SmashKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SmashKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "call" => Ok(SmashKind::Call),
            "jmp" => Ok(SmashKind::Jmp),
            "jcc" => Ok(SmashKind::Jcc),
            "movq" => Ok(SmashKind::Movq),
            "cmpq" => Ok(SmashKind::Cmpq),
            other => Err(format!("unknown smashable kind '{other}'")),
        }
    }
}

/// Architecture-neutral branch conditions, named after flag tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConditionCode {
    Overflow,
    NoOverflow,
    Below,
    AboveEqual,
    Equal,
    NotEqual,
    BelowEqual,
    Above,
    Sign,
    NotSign,
    LessThan,
    GreaterEqual,
    LessEqual,
    GreaterThan,
    /// Unconditional.
    None,
}

impl ConditionCode {
    pub const ALL: [ConditionCode; 14] = [
        ConditionCode::Overflow,
        ConditionCode::NoOverflow,
        ConditionCode::Below,
        ConditionCode::AboveEqual,
        ConditionCode::Equal,
        ConditionCode::NotEqual,
        ConditionCode::BelowEqual,
        ConditionCode::Above,
        ConditionCode::Sign,
        ConditionCode::NotSign,
        ConditionCode::LessThan,
        ConditionCode::GreaterEqual,
        ConditionCode::LessEqual,
        ConditionCode::GreaterThan,
    ];

    pub fn invert(self) -> Self {
        match self {
            ConditionCode::Overflow => ConditionCode::NoOverflow,
            ConditionCode::NoOverflow => ConditionCode::Overflow,
            ConditionCode::Below => ConditionCode::AboveEqual,
            ConditionCode::AboveEqual => ConditionCode::Below,
            ConditionCode::Equal => ConditionCode::NotEqual,
            ConditionCode::NotEqual => ConditionCode::Equal,
            ConditionCode::BelowEqual => ConditionCode::Above,
            ConditionCode::Above => ConditionCode::BelowEqual,
            ConditionCode::Sign => ConditionCode::NotSign,
            ConditionCode::NotSign => ConditionCode::Sign,
            ConditionCode::LessThan => ConditionCode::GreaterEqual,
            ConditionCode::GreaterEqual => ConditionCode::LessThan,
            ConditionCode::LessEqual => ConditionCode::GreaterThan,
            ConditionCode::GreaterThan => ConditionCode::LessEqual,
            ConditionCode::None => ConditionCode::None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ConditionCode::Overflow => "o",
            ConditionCode::NoOverflow => "no",
            ConditionCode::Below => "b",
            ConditionCode::AboveEqual => "ae",
            ConditionCode::Equal => "e",
            ConditionCode::NotEqual => "ne",
            ConditionCode::BelowEqual => "be",
            ConditionCode::Above => "a",
            ConditionCode::Sign => "s",
            ConditionCode::NotSign => "ns",
            ConditionCode::LessThan => "l",
            ConditionCode::GreaterEqual => "ge",
            ConditionCode::LessEqual => "le",
            ConditionCode::GreaterThan => "g",
            ConditionCode::None => "none",
        }
    }
}

impl std::fmt::Display for ConditionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ConditionCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == ConditionCode::None.name() {
            return Ok(ConditionCode::None);
        }
        ConditionCode::ALL
            .into_iter()
            .find(|cc| cc.name() == s)
            .ok_or_else(|| format!("unknown condition code '{s}'"))
    }
}

/// One instruction-set's smashable sequences.
///
/// Encoders append a whole sequence or nothing. Decoders return `None` when
/// the bytes at the address are not a sequence of the requested kind.
///
/// # Safety
///
/// Every `unsafe fn` here takes the start address of previously emitted
/// code. The caller guarantees that the sequence-length bytes starting there
/// (see [`SmashableBackend::sequence_len`]) are mapped and readable, and for
/// the `smash_*` functions that the slot is writable.
pub trait SmashableBackend {
    const NAME: &'static str;

    /// Slot offset from `start`. Depends only on the kind and on `start`'s
    /// alignment.
    fn slot_offset(kind: SmashKind, start: CodeAddress) -> Option<usize>;

    fn sequence_len(kind: SmashKind, start: CodeAddress) -> Option<usize>;

    fn max_len(kind: SmashKind) -> Option<usize>;

    /// Renders one instruction word of this backend.
    fn describe_word(word: u32) -> String;

    fn emit_call(cb: &mut CodeBuffer, target: CodeAddress) -> SmashResult<CodeAddress>;

    fn emit_jmp(cb: &mut CodeBuffer, target: CodeAddress) -> SmashResult<CodeAddress>;

    fn emit_jcc(
        cb: &mut CodeBuffer,
        target: CodeAddress,
        cc: ConditionCode,
    ) -> SmashResult<CodeAddress>;

    fn emit_jcc_and_jmp(
        cb: &mut CodeBuffer,
        target: CodeAddress,
        cc: ConditionCode,
    ) -> SmashResult<(CodeAddress, CodeAddress)> {
        if target.is_null() {
            return Err(SmashError::InvalidTarget);
        }
        if cc == ConditionCode::None {
            return Err(SmashError::InvalidCondition(cc));
        }
        let needed = Self::max_len(SmashKind::Jcc)
            .zip(Self::max_len(SmashKind::Jmp))
            .map(|(jcc, jmp)| jcc + jmp)
            .ok_or(SmashError::Unsupported {
                op: "jcc+jmp",
                arch: Self::NAME,
            })?;
        cb.reserve(needed)?;
        let jcc = Self::emit_jcc(cb, target, cc)?;
        let jmp = Self::emit_jmp(cb, target)?;
        Ok((jcc, jmp))
    }

    /// Backends without late-patchable immediates abort here.
    fn emit_movq(cb: &mut CodeBuffer, imm: u64, dst: u8) -> SmashResult<CodeAddress>;

    fn emit_cmpq(cb: &mut CodeBuffer, imm: i32, base: u8, disp: i8) -> SmashResult<CodeAddress>;

    unsafe fn call_target(inst: CodeAddress) -> Option<CodeAddress>;

    unsafe fn jmp_target(inst: CodeAddress) -> Option<CodeAddress>;

    unsafe fn jcc_target(inst: CodeAddress) -> Option<CodeAddress>;

    /// The condition under which the jcc at `inst` takes its target.
    unsafe fn jcc_cond(inst: CodeAddress) -> Option<ConditionCode>;

    unsafe fn movq_imm(inst: CodeAddress) -> u64;

    unsafe fn smash_call(inst: CodeAddress, target: CodeAddress);

    unsafe fn smash_jmp(inst: CodeAddress, target: CodeAddress);

    /// Retargets a jcc. The condition is fixed at emission.
    unsafe fn smash_jcc(inst: CodeAddress, target: CodeAddress);

    unsafe fn smash_movq(inst: CodeAddress, imm: u64);

    unsafe fn smash_cmpq(inst: CodeAddress, imm: i32);
}

/// Slot address for a sequence at `start` whose unpadded slot sits `base`
/// bytes in: the next [`SLOT_SIZE`]-aligned address, which is either
/// `start + base` or one 4-byte instruction later.
pub(crate) fn align_slot(start: CodeAddress, base: usize) -> CodeAddress {
    let mut slot = start.add(base);
    if !slot.is_aligned(SLOT_SIZE) {
        slot = slot.add(4);
    }
    assert!(
        slot.is_aligned(SLOT_SIZE),
        "smashable slot {slot} for sequence at {start} is misaligned"
    );
    slot
}

/// # Safety
///
/// `slot` must be mapped, readable and [`SLOT_SIZE`]-aligned.
pub(crate) unsafe fn load_slot(slot: CodeAddress) -> u64 {
    let cell = unsafe { AtomicU64::from_ptr(slot.as_mut_ptr().cast::<u64>()) };
    u64::from_le(cell.load(Ordering::Acquire))
}

/// # Safety
///
/// `slot` must be mapped, writable and [`SLOT_SIZE`]-aligned.
pub(crate) unsafe fn store_slot(slot: CodeAddress, value: u64) {
    let cell = unsafe { AtomicU64::from_ptr(slot.as_mut_ptr().cast::<u64>()) };
    cell.store(value.to_le(), Ordering::Release);
    trace!(slot = %slot, value = format_args!("{value:#x}"), "smashed slot");
}

pub(crate) fn slot_to_address(value: u64) -> Option<CodeAddress> {
    usize::try_from(value).ok().map(CodeAddress::new)
}

impl CodeBuffer {
    /// Decodes the target of a `kind` sequence at `at`, provided the whole
    /// sequence lies inside this buffer.
    pub fn smashable_target(&self, kind: SmashKind, at: CodeAddress) -> Option<CodeAddress> {
        if !self.holds_sequence::<DefaultBackend>(kind, at) {
            return None;
        }
        unsafe {
            match kind {
                SmashKind::Call => DefaultBackend::call_target(at),
                SmashKind::Jmp => DefaultBackend::jmp_target(at),
                SmashKind::Jcc => DefaultBackend::jcc_target(at),
                SmashKind::Movq | SmashKind::Cmpq => None,
            }
        }
    }

    pub fn smashable_cond(&self, at: CodeAddress) -> Option<ConditionCode> {
        if !self.holds_sequence::<DefaultBackend>(SmashKind::Jcc, at) {
            return None;
        }
        unsafe { DefaultBackend::jcc_cond(at) }
    }

    /// Retargets the `kind` sequence at `at` after checking that one is
    /// really there.
    pub fn smash(&self, kind: SmashKind, at: CodeAddress, target: CodeAddress) -> SmashResult<()> {
        if matches!(kind, SmashKind::Movq | SmashKind::Cmpq) {
            return Err(SmashError::Unsupported {
                op: kind.name(),
                arch: DefaultBackend::NAME,
            });
        }
        if target.is_null() {
            return Err(SmashError::InvalidTarget);
        }
        if self.is_finalized() {
            return Err(SmashError::Sealed);
        }
        let len = DefaultBackend::sequence_len(kind, at).unwrap_or(0);
        if !self.contains(at, len) {
            return Err(SmashError::OutOfBounds { at, len });
        }
        if self.smashable_target(kind, at).is_none() {
            return Err(SmashError::NotSmashable { kind, at });
        }
        unsafe {
            match kind {
                SmashKind::Call => DefaultBackend::smash_call(at, target),
                SmashKind::Jmp => DefaultBackend::smash_jmp(at, target),
                SmashKind::Jcc => DefaultBackend::smash_jcc(at, target),
                SmashKind::Movq | SmashKind::Cmpq => {}
            }
        }
        Ok(())
    }

    fn holds_sequence<B: SmashableBackend>(&self, kind: SmashKind, at: CodeAddress) -> bool {
        at.is_aligned(4)
            && B::sequence_len(kind, at).is_some_and(|len| self.contains(at, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_slot_bumps_by_one_instruction() {
        assert_eq!(
            align_slot(CodeAddress::new(0x1000), 8),
            CodeAddress::new(0x1008)
        );
        assert_eq!(
            align_slot(CodeAddress::new(0x1004), 8),
            CodeAddress::new(0x1010)
        );
        assert_eq!(
            align_slot(CodeAddress::new(0x1000), 12),
            CodeAddress::new(0x1010)
        );
        assert_eq!(
            align_slot(CodeAddress::new(0x1004), 12),
            CodeAddress::new(0x1010)
        );
    }

    #[test]
    #[should_panic(expected = "misaligned")]
    fn align_slot_rejects_unaligned_instruction_start() {
        let _ = align_slot(CodeAddress::new(0x1002), 8);
    }

    #[test]
    fn condition_inversion_is_an_involution() {
        for cc in ConditionCode::ALL {
            assert_ne!(cc.invert(), cc);
            assert_eq!(cc.invert().invert(), cc);
        }
        assert_eq!(ConditionCode::None.invert(), ConditionCode::None);
    }

    #[test]
    fn names_parse_back() {
        for cc in ConditionCode::ALL {
            assert_eq!(cc.name().parse::<ConditionCode>(), Ok(cc));
        }
        assert_eq!("none".parse::<ConditionCode>(), Ok(ConditionCode::None));
        assert!("always".parse::<ConditionCode>().is_err());
        assert_eq!("jcc".parse::<SmashKind>(), Ok(SmashKind::Jcc));
        assert!("ret".parse::<SmashKind>().is_err());
    }
}
