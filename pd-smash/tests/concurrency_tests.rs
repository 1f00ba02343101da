mod common;

use std::sync::atomic::{AtomicBool, Ordering};

use common::*;

#[test]
fn concurrent_decoders_never_observe_a_torn_target() {
    let old = CodeAddress::new(0x1111_1111_1111_1110);
    let new = CodeAddress::new(0x2222_2222_2222_2220);

    let mut cb = buffer();
    let mut starts = Vec::new();
    for (i, kind) in CONTROL_FLOW_KINDS.into_iter().enumerate() {
        skew(&mut cb, i % 2);
        starts.push((kind, emit(&mut cb, kind, old)));
    }
    let cb = cb;
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        for _ in 0..3 {
            scope.spawn(|| {
                let mut observed = 0usize;
                while !done.load(Ordering::Acquire) {
                    for &(kind, start) in &starts {
                        let target = cb
                            .smashable_target(kind, start)
                            .expect("sequence should keep decoding while smashed");
                        assert!(
                            target == old || target == new,
                            "torn {kind} target {target}"
                        );
                        observed += 1;
                    }
                }
                assert!(observed > 0);
            });
        }

        for round in 0..20_000 {
            let target = if round % 2 == 0 { new } else { old };
            for &(kind, start) in &starts {
                cb.smash(kind, start, target).expect("smash");
            }
        }
        done.store(true, Ordering::Release);
    });

    for &(kind, start) in &starts {
        assert_eq!(cb.smashable_target(kind, start), Some(old));
    }
}

#[test]
fn smashing_distinct_slots_from_many_threads_is_independent() {
    let mut cb = buffer();
    let starts: Vec<CodeAddress> = (0..8)
        .map(|i| {
            skew(&mut cb, i % 2);
            emit(&mut cb, SmashKind::Jmp, CodeAddress::new(0x1000))
        })
        .collect();
    let cb = cb;

    std::thread::scope(|scope| {
        for (i, start) in starts.iter().copied().enumerate() {
            let cb = &cb;
            scope.spawn(move || {
                for round in 1..=1000usize {
                    let target = CodeAddress::new((i + 1) * 0x10_0000 + round * 8);
                    cb.smash(SmashKind::Jmp, start, target).expect("smash");
                }
            });
        }
    });

    for (i, start) in starts.iter().enumerate() {
        assert_eq!(
            cb.smashable_target(SmashKind::Jmp, *start),
            Some(CodeAddress::new((i + 1) * 0x10_0000 + 1000 * 8))
        );
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
mod native {
    use super::*;

    type Entry0 = unsafe extern "C" fn() -> u64;
    type Entry1 = unsafe extern "C" fn(u64) -> u64;

    const STP_FP_LR_PRE: u32 = 0xA9BF_7BFD; // stp x29, x30, [sp, #-16]!
    const MOV_FP_SP: u32 = 0x9100_03FD; // mov x29, sp
    const LDP_FP_LR_POST: u32 = 0xA8C1_7BFD; // ldp x29, x30, [sp], #16
    const RET: u32 = 0xD65F_03C0;
    const CMP_X0_ZERO: u32 = 0xF100_001F; // cmp x0, #0
    const MOV_X0_FIVE: u32 = 0xD280_00A0; // mov x0, #5

    extern "C" fn return_one() -> u64 {
        1
    }

    extern "C" fn return_two() -> u64 {
        2
    }

    extern "C" fn return_seven() -> u64 {
        7
    }

    fn address_of(function: extern "C" fn() -> u64) -> CodeAddress {
        CodeAddress::new(function as usize)
    }

    fn executable_buffer() -> CodeBuffer {
        CodeBuffer::new(CodeBufferConfig {
            capacity: 4096,
            protection: Protection::ReadWriteExecute,
        })
        .expect("rwx buffer should map")
    }

    /// `fn() -> u64` whose body is one smashable call.
    fn emit_call_thunk(cb: &mut CodeBuffer, target: CodeAddress) -> (CodeAddress, CodeAddress) {
        let entry = cb.frontier();
        cb.emit_u32(STP_FP_LR_PRE).expect("prologue");
        cb.emit_u32(MOV_FP_SP).expect("prologue");
        let call = AArch64::emit_call(cb, target).expect("emit call");
        cb.emit_u32(LDP_FP_LR_POST).expect("epilogue");
        cb.emit_u32(RET).expect("epilogue");
        cb.sync_emitted();
        (entry, call)
    }

    #[test]
    fn smashed_call_redirects_execution() {
        let mut cb = executable_buffer();
        let (entry, call) = emit_call_thunk(&mut cb, address_of(return_one));
        let run = unsafe { std::mem::transmute::<*const u8, Entry0>(entry.as_ptr()) };

        assert_eq!(unsafe { run() }, 1);
        cb.smash(SmashKind::Call, call, address_of(return_two))
            .expect("smash call");
        assert_eq!(unsafe { run() }, 2);
    }

    #[test]
    fn jcc_takes_target_only_when_condition_holds() {
        let mut cb = executable_buffer();
        let entry = cb.frontier();
        cb.emit_u32(CMP_X0_ZERO).expect("cmp");
        let jcc = AArch64::emit_jcc(&mut cb, address_of(return_seven), ConditionCode::Equal)
            .expect("emit jcc");
        cb.emit_u32(MOV_X0_FIVE).expect("fallthrough");
        cb.emit_u32(RET).expect("ret");
        cb.sync_emitted();
        let run = unsafe { std::mem::transmute::<*const u8, Entry1>(entry.as_ptr()) };

        assert_eq!(unsafe { run(0) }, 7);
        assert_eq!(unsafe { run(1) }, 5);

        cb.smash(SmashKind::Jcc, jcc, address_of(return_one))
            .expect("smash jcc");
        assert_eq!(unsafe { run(0) }, 1);
        assert_eq!(unsafe { run(1) }, 5);
    }

    #[test]
    fn threads_executing_a_call_see_old_or_new_target() {
        let mut cb = executable_buffer();
        let (entry, call) = emit_call_thunk(&mut cb, address_of(return_one));
        let run = unsafe { std::mem::transmute::<*const u8, Entry0>(entry.as_ptr()) };
        let cb = cb;
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    while !done.load(Ordering::Acquire) {
                        let value = unsafe { run() };
                        assert!(value == 1 || value == 2, "unexpected result {value}");
                    }
                });
            }
            for round in 0..50_000 {
                let target = if round % 2 == 0 {
                    address_of(return_two)
                } else {
                    address_of(return_one)
                };
                cb.smash(SmashKind::Call, call, target).expect("smash call");
            }
            done.store(true, Ordering::Release);
        });

        assert_eq!(unsafe { run() }, 1);
    }
}
