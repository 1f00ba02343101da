// Layouts; `[nop]` only when the slot would otherwise be misaligned.
//
//   jmp:  ldr x16, slot ; br x16  ; [nop] ; slot
//   call: ldr x16, slot ; blr x16 ; b after ; [nop] ; slot ; after:
//   jcc:  b.!cc after   ; <jmp>   ; after:

use tracing::{debug, error};

use super::{
    ConditionCode, SLOT_SIZE, SmashKind, SmashableBackend, align_slot, load_slot,
    slot_to_address, store_slot,
};
use crate::address::CodeAddress;
use crate::code_buffer::CodeBuffer;
use crate::error::{SmashError, SmashResult};

pub struct AArch64;

// IP0
const SCRATCH_REG: u8 = 16;

const INSN_SIZE: usize = 4;

const JMP_SLOT_BASE: usize = 8;
const CALL_SLOT_BASE: usize = 12;
const JCC_SLOT_BASE: usize = 12;

const JMP_MAX_LEN: usize = JMP_SLOT_BASE + INSN_SIZE + SLOT_SIZE;
const CALL_MAX_LEN: usize = CALL_SLOT_BASE + INSN_SIZE + SLOT_SIZE;
const JCC_MAX_LEN: usize = JCC_SLOT_BASE + INSN_SIZE + SLOT_SIZE;

// ---------------------------------------------------------------------------
// Opcode table shared by encoders and decoders.

#[derive(Clone, Copy, Debug)]
struct Pattern {
    mask: u32,
    bits: u32,
}

impl Pattern {
    const fn matches(self, word: u32) -> bool {
        word & self.mask == self.bits
    }
}

const LDR_LITERAL_X: Pattern = Pattern {
    mask: 0xFF00_0000,
    bits: 0x5800_0000,
};
// br/blr leave `rn` out of the mask.
const BR: Pattern = Pattern {
    mask: 0xFFFF_FC1F,
    bits: 0xD61F_0000,
};
const BLR: Pattern = Pattern {
    mask: 0xFFFF_FC1F,
    bits: 0xD63F_0000,
};
const B: Pattern = Pattern {
    mask: 0xFC00_0000,
    bits: 0x1400_0000,
};
const B_COND: Pattern = Pattern {
    mask: 0xFF00_0010,
    bits: 0x5400_0000,
};
const NOP: Pattern = Pattern {
    mask: 0xFFFF_FFFF,
    bits: 0xD503_201F,
};

fn ldr_literal_x(rt: u8, offset: usize) -> u32 {
    LDR_LITERAL_X.bits | (imm19(offset) << 5) | u32::from(rt)
}

fn br(rn: u8) -> u32 {
    BR.bits | (u32::from(rn) << 5)
}

fn blr(rn: u8) -> u32 {
    BLR.bits | (u32::from(rn) << 5)
}

fn b(offset: usize) -> u32 {
    assert!(
        offset % INSN_SIZE == 0,
        "branch displacement {offset} is not instruction aligned"
    );
    let imm26 = offset / INSN_SIZE;
    assert!(imm26 < (1 << 25), "b displacement {offset} out of range");
    B.bits | imm26 as u32
}

fn b_cond(cond: Cond, offset: usize) -> u32 {
    B_COND.bits | (imm19(offset) << 5) | cond as u32
}

// Forward displacements only.
fn imm19(offset: usize) -> u32 {
    assert!(
        offset % INSN_SIZE == 0,
        "branch displacement {offset} is not instruction aligned"
    );
    let imm = offset / INSN_SIZE;
    assert!(imm < (1 << 18), "imm19 displacement {offset} out of range");
    imm as u32
}

fn field_rt(word: u32) -> u8 {
    (word & 0x1F) as u8
}

fn field_rn(word: u32) -> u8 {
    ((word >> 5) & 0x1F) as u8
}

fn field_imm19(word: u32) -> i64 {
    let raw = (word >> 5) & 0x7FFFF;
    i64::from(((raw << 13) as i32) >> 13) * INSN_SIZE as i64
}

fn field_imm26(word: u32) -> i64 {
    let raw = word & 0x03FF_FFFF;
    i64::from(((raw << 6) as i32) >> 6) * INSN_SIZE as i64
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Cond {
    Eq = 0,
    Ne = 1,
    Hs = 2,
    Lo = 3,
    Mi = 4,
    Pl = 5,
    Vs = 6,
    Vc = 7,
    Hi = 8,
    Ls = 9,
    Ge = 10,
    Lt = 11,
    Gt = 12,
    Le = 13,
    Al = 14,
    Nv = 15,
}

impl Cond {
    fn from_bits(bits: u32) -> Self {
        match bits & 0xF {
            0 => Cond::Eq,
            1 => Cond::Ne,
            2 => Cond::Hs,
            3 => Cond::Lo,
            4 => Cond::Mi,
            5 => Cond::Pl,
            6 => Cond::Vs,
            7 => Cond::Vc,
            8 => Cond::Hi,
            9 => Cond::Ls,
            10 => Cond::Ge,
            11 => Cond::Lt,
            12 => Cond::Gt,
            13 => Cond::Le,
            14 => Cond::Al,
            _ => Cond::Nv,
        }
    }

    fn from_condition(cc: ConditionCode) -> Option<Self> {
        Some(match cc {
            ConditionCode::Overflow => Cond::Vs,
            ConditionCode::NoOverflow => Cond::Vc,
            ConditionCode::Below => Cond::Lo,
            ConditionCode::AboveEqual => Cond::Hs,
            ConditionCode::Equal => Cond::Eq,
            ConditionCode::NotEqual => Cond::Ne,
            ConditionCode::BelowEqual => Cond::Ls,
            ConditionCode::Above => Cond::Hi,
            ConditionCode::Sign => Cond::Mi,
            ConditionCode::NotSign => Cond::Pl,
            ConditionCode::LessThan => Cond::Lt,
            ConditionCode::GreaterEqual => Cond::Ge,
            ConditionCode::LessEqual => Cond::Le,
            ConditionCode::GreaterThan => Cond::Gt,
            ConditionCode::None => return None,
        })
    }

    fn to_condition(self) -> Option<ConditionCode> {
        Some(match self {
            Cond::Vs => ConditionCode::Overflow,
            Cond::Vc => ConditionCode::NoOverflow,
            Cond::Lo => ConditionCode::Below,
            Cond::Hs => ConditionCode::AboveEqual,
            Cond::Eq => ConditionCode::Equal,
            Cond::Ne => ConditionCode::NotEqual,
            Cond::Ls => ConditionCode::BelowEqual,
            Cond::Hi => ConditionCode::Above,
            Cond::Mi => ConditionCode::Sign,
            Cond::Pl => ConditionCode::NotSign,
            Cond::Lt => ConditionCode::LessThan,
            Cond::Ge => ConditionCode::GreaterEqual,
            Cond::Le => ConditionCode::LessEqual,
            Cond::Gt => ConditionCode::GreaterThan,
            Cond::Al | Cond::Nv => return None,
        })
    }

    // Pairs differ in the low bit. Not meaningful for `al`/`nv`.
    fn invert(self) -> Self {
        Cond::from_bits(self as u32 ^ 1)
    }

    fn mnemonic(self) -> &'static str {
        match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Hs => "hs",
            Cond::Lo => "lo",
            Cond::Mi => "mi",
            Cond::Pl => "pl",
            Cond::Vs => "vs",
            Cond::Vc => "vc",
            Cond::Hi => "hi",
            Cond::Ls => "ls",
            Cond::Ge => "ge",
            Cond::Lt => "lt",
            Cond::Gt => "gt",
            Cond::Le => "le",
            Cond::Al => "al",
            Cond::Nv => "nv",
        }
    }
}

// ---------------------------------------------------------------------------
// Layout

fn slot_base(kind: SmashKind) -> Option<usize> {
    match kind {
        SmashKind::Jmp => Some(JMP_SLOT_BASE),
        SmashKind::Call => Some(CALL_SLOT_BASE),
        SmashKind::Jcc => Some(JCC_SLOT_BASE),
        SmashKind::Movq | SmashKind::Cmpq => None,
    }
}

fn locate_slot(start: CodeAddress, base: usize) -> CodeAddress {
    align_slot(start, base)
}

fn slot_distance(start: CodeAddress, slot: CodeAddress) -> usize {
    slot.raw() - start.raw()
}

fn check_target(target: CodeAddress) -> SmashResult<()> {
    if target.is_null() {
        return Err(SmashError::InvalidTarget);
    }
    Ok(())
}

fn target_word(target: CodeAddress) -> u64 {
    target.raw() as u64
}

fn pad_to_slot(cb: &mut CodeBuffer, slot: CodeAddress) -> SmashResult<()> {
    if cb.frontier() != slot {
        cb.emit_u32(NOP.bits)?;
    }
    assert_eq!(
        cb.frontier(),
        slot,
        "emitted smashable slot drifted from its located address"
    );
    Ok(())
}

fn unsupported(op: &'static str) -> ! {
    error!(op, arch = AArch64::NAME, "unsupported smashable operation requested");
    panic!("smashable {op} is not implemented on {}", AArch64::NAME);
}

// ---------------------------------------------------------------------------
// Encoder

// Caller has reserved JMP_MAX_LEN bytes.
fn emit_jmp_body(cb: &mut CodeBuffer, target: CodeAddress) -> SmashResult<CodeAddress> {
    let start = cb.frontier();
    let slot = locate_slot(start, JMP_SLOT_BASE);

    cb.emit_u32(ldr_literal_x(SCRATCH_REG, slot_distance(start, slot)))?;
    cb.emit_u32(br(SCRATCH_REG))?;
    pad_to_slot(cb, slot)?;
    cb.emit_u64(target_word(target))?;
    Ok(start)
}

fn log_emitted(kind: SmashKind, cb: &CodeBuffer, start: CodeAddress, target: CodeAddress) {
    debug!(
        kind = kind.name(),
        start = %start,
        len = slot_distance(start, cb.frontier()),
        target = %target,
        "emitted smashable sequence"
    );
}

// ---------------------------------------------------------------------------
// Decoder

// `at` must be 4-byte aligned, mapped and readable.
unsafe fn read_word(at: CodeAddress) -> u32 {
    let bytes = unsafe { at.as_ptr().cast::<[u8; 4]>().read() };
    u32::from_le_bytes(bytes)
}

unsafe fn match_literal_branch(
    inst: CodeAddress,
    branch: Pattern,
    slot_base: usize,
) -> Option<CodeAddress> {
    let ldr = unsafe { read_word(inst) };
    if !LDR_LITERAL_X.matches(ldr) || field_rt(ldr) != SCRATCH_REG {
        return None;
    }
    let indirect = unsafe { read_word(inst.add(INSN_SIZE)) };
    if !branch.matches(indirect) || field_rn(indirect) != SCRATCH_REG {
        return None;
    }
    let slot = locate_slot(inst, slot_base);
    if field_imm19(ldr) != slot_distance(inst, slot) as i64 {
        return None;
    }
    Some(slot)
}

// Returns the nested jmp's slot and the leading `b.cond` condition.
unsafe fn match_jcc(inst: CodeAddress) -> Option<(CodeAddress, Cond)> {
    let head = unsafe { read_word(inst) };
    if !B_COND.matches(head) {
        return None;
    }
    let cond = Cond::from_bits(head);
    if matches!(cond, Cond::Al | Cond::Nv) {
        return None;
    }
    let nested = inst.add(INSN_SIZE);
    let slot = unsafe { match_literal_branch(nested, BR, JMP_SLOT_BASE) }?;
    debug_assert_eq!(slot, locate_slot(inst, JCC_SLOT_BASE));
    let after = slot.add(SLOT_SIZE);
    if field_imm19(head) != slot_distance(inst, after) as i64 {
        return None;
    }
    Some((slot, cond))
}

// ---------------------------------------------------------------------------

impl SmashableBackend for AArch64 {
    const NAME: &'static str = "aarch64";

    fn slot_offset(kind: SmashKind, start: CodeAddress) -> Option<usize> {
        let base = slot_base(kind)?;
        if !start.is_aligned(INSN_SIZE) {
            return None;
        }
        Some(slot_distance(start, locate_slot(start, base)))
    }

    fn sequence_len(kind: SmashKind, start: CodeAddress) -> Option<usize> {
        Self::slot_offset(kind, start).map(|offset| offset + SLOT_SIZE)
    }

    fn max_len(kind: SmashKind) -> Option<usize> {
        match kind {
            SmashKind::Jmp => Some(JMP_MAX_LEN),
            SmashKind::Call => Some(CALL_MAX_LEN),
            SmashKind::Jcc => Some(JCC_MAX_LEN),
            SmashKind::Movq | SmashKind::Cmpq => None,
        }
    }

    fn describe_word(word: u32) -> String {
        if NOP.matches(word) {
            "nop".to_string()
        } else if LDR_LITERAL_X.matches(word) {
            format!("ldr x{}, #{:+}", field_rt(word), field_imm19(word))
        } else if BR.matches(word) {
            format!("br x{}", field_rn(word))
        } else if BLR.matches(word) {
            format!("blr x{}", field_rn(word))
        } else if B.matches(word) {
            format!("b #{:+}", field_imm26(word))
        } else if B_COND.matches(word) {
            format!(
                "b.{} #{:+}",
                Cond::from_bits(word).mnemonic(),
                field_imm19(word)
            )
        } else {
            format!(".word {word:#010x}")
        }
    }

    fn emit_call(cb: &mut CodeBuffer, target: CodeAddress) -> SmashResult<CodeAddress> {
        check_target(target)?;
        cb.reserve(CALL_MAX_LEN)?;

        let start = cb.frontier();
        let slot = locate_slot(start, CALL_SLOT_BASE);
        let after = slot.add(SLOT_SIZE);

        cb.emit_u32(ldr_literal_x(SCRATCH_REG, slot_distance(start, slot)))?;
        cb.emit_u32(blr(SCRATCH_REG))?;
        // The call returns here; jump over the literal.
        let skip_from = cb.frontier();
        cb.emit_u32(b(slot_distance(skip_from, after)))?;
        pad_to_slot(cb, slot)?;
        cb.emit_u64(target_word(target))?;

        log_emitted(SmashKind::Call, cb, start, target);
        Ok(start)
    }

    fn emit_jmp(cb: &mut CodeBuffer, target: CodeAddress) -> SmashResult<CodeAddress> {
        check_target(target)?;
        cb.reserve(JMP_MAX_LEN)?;

        let start = emit_jmp_body(cb, target)?;
        log_emitted(SmashKind::Jmp, cb, start, target);
        Ok(start)
    }

    fn emit_jcc(
        cb: &mut CodeBuffer,
        target: CodeAddress,
        cc: ConditionCode,
    ) -> SmashResult<CodeAddress> {
        check_target(target)?;
        let cond = Cond::from_condition(cc).ok_or(SmashError::InvalidCondition(cc))?;
        cb.reserve(JCC_MAX_LEN)?;

        let start = cb.frontier();
        let after = locate_slot(start, JCC_SLOT_BASE).add(SLOT_SIZE);

        // Skip the jmp unless `cc` holds.
        cb.emit_u32(b_cond(cond.invert(), slot_distance(start, after)))?;
        emit_jmp_body(cb, target)?;
        assert_eq!(cb.frontier(), after, "jcc skip target drifted");

        log_emitted(SmashKind::Jcc, cb, start, target);
        Ok(start)
    }

    fn emit_movq(_cb: &mut CodeBuffer, _imm: u64, _dst: u8) -> SmashResult<CodeAddress> {
        unsupported("movq")
    }

    fn emit_cmpq(
        _cb: &mut CodeBuffer,
        _imm: i32,
        _base: u8,
        _disp: i8,
    ) -> SmashResult<CodeAddress> {
        unsupported("cmpq")
    }

    unsafe fn call_target(inst: CodeAddress) -> Option<CodeAddress> {
        let slot = unsafe { match_literal_branch(inst, BLR, CALL_SLOT_BASE) }?;
        slot_to_address(unsafe { load_slot(slot) })
    }

    unsafe fn jmp_target(inst: CodeAddress) -> Option<CodeAddress> {
        // Only the load and the indirect branch are checked; the rest of
        // the shape follows from them.
        let slot = unsafe { match_literal_branch(inst, BR, JMP_SLOT_BASE) }?;
        slot_to_address(unsafe { load_slot(slot) })
    }

    unsafe fn jcc_target(inst: CodeAddress) -> Option<CodeAddress> {
        let (slot, _) = unsafe { match_jcc(inst) }?;
        slot_to_address(unsafe { load_slot(slot) })
    }

    unsafe fn jcc_cond(inst: CodeAddress) -> Option<ConditionCode> {
        let (_, cond) = unsafe { match_jcc(inst) }?;
        // The emitted branch skips the jump, so it holds the inverse.
        cond.invert().to_condition()
    }

    unsafe fn movq_imm(_inst: CodeAddress) -> u64 {
        unsupported("movq")
    }

    unsafe fn smash_call(inst: CodeAddress, target: CodeAddress) {
        unsafe { store_slot(locate_slot(inst, CALL_SLOT_BASE), target_word(target)) };
    }

    unsafe fn smash_jmp(inst: CodeAddress, target: CodeAddress) {
        unsafe { store_slot(locate_slot(inst, JMP_SLOT_BASE), target_word(target)) };
    }

    unsafe fn smash_jcc(inst: CodeAddress, target: CodeAddress) {
        unsafe { store_slot(locate_slot(inst, JCC_SLOT_BASE), target_word(target)) };
    }

    unsafe fn smash_movq(_inst: CodeAddress, _imm: u64) {
        unsupported("movq")
    }

    unsafe fn smash_cmpq(_inst: CodeAddress, _imm: i32) {
        unsupported("cmpq")
    }
}
