#![allow(dead_code, unused_imports)]

pub use smash::{
    AArch64, CodeAddress, CodeBuffer, CodeBufferConfig, ConditionCode, Protection, SLOT_SIZE,
    SmashError, SmashKind, SmashableBackend, format_sequence,
};

pub const NOP_WORD: u32 = 0xD503_201F;

pub fn buffer() -> CodeBuffer {
    CodeBuffer::with_capacity(64 * 1024).expect("code buffer should map")
}

/// Emits `skew` nops so the next sequence starts at a chosen alignment.
pub fn skew(cb: &mut CodeBuffer, words: usize) {
    for _ in 0..words {
        cb.emit_u32(NOP_WORD).expect("nop should fit");
    }
}

pub fn emit(cb: &mut CodeBuffer, kind: SmashKind, target: CodeAddress) -> CodeAddress {
    match kind {
        SmashKind::Call => AArch64::emit_call(cb, target).expect("emit call"),
        SmashKind::Jmp => AArch64::emit_jmp(cb, target).expect("emit jmp"),
        SmashKind::Jcc => {
            AArch64::emit_jcc(cb, target, ConditionCode::NotEqual).expect("emit jcc")
        }
        SmashKind::Movq | SmashKind::Cmpq => panic!("{kind} has no smashable target"),
    }
}

pub const CONTROL_FLOW_KINDS: [SmashKind; 3] = [SmashKind::Call, SmashKind::Jmp, SmashKind::Jcc];

pub fn sample_targets() -> Vec<CodeAddress> {
    vec![
        CodeAddress::new(0x1000),
        CodeAddress::new(0x2000),
        CodeAddress::new(0x7FFF_FFFF_FFF8),
        CodeAddress::new(0x0000_5555_DEAD_BEEF),
        CodeAddress::new(usize::MAX),
        CodeAddress::new(4),
    ]
}
