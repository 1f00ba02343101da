use std::fmt::Write as _;

use crate::address::CodeAddress;
use crate::code_buffer::CodeBuffer;
use crate::smashable::{DefaultBackend, SmashKind, SmashableBackend};

/// Renders the `kind` sequence at `at` one instruction per line, followed by
/// its slot and decoded target. Returns `None` unless the decoder accepts the
/// sequence.
pub fn format_sequence(cb: &CodeBuffer, kind: SmashKind, at: CodeAddress) -> Option<String> {
    let target = cb.smashable_target(kind, at)?;
    let slot_offset = DefaultBackend::slot_offset(kind, at)?;

    let mut out = String::new();
    let _ = writeln!(out, "smashable {kind} @ {at}");
    for offset in (0..slot_offset).step_by(4) {
        let addr = at.add(offset);
        let word = cb.word_at(addr)?;
        let _ = writeln!(
            out,
            "  {addr}  {word:08x}  {}",
            DefaultBackend::describe_word(word)
        );
    }
    let _ = writeln!(out, "  {}  .quad {target}", at.add(slot_offset));
    if kind == SmashKind::Jcc
        && let Some(cc) = cb.smashable_cond(at)
    {
        let _ = writeln!(out, "  -> {target} if {cc}");
    } else {
        let _ = writeln!(out, "  -> {target}");
    }
    Some(out)
}
