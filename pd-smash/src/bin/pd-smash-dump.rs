use std::io;

use smash::{
    AArch64, CodeAddress, CodeBuffer, ConditionCode, SmashKind, SmashableBackend, format_sequence,
};
use tracing::info;

const NOP_WORD: u32 = 0xD503_201F;

#[derive(Debug, Clone, PartialEq, Eq)]
struct DumpConfig {
    kind: SmashKind,
    target: CodeAddress,
    cond: ConditionCode,
    patch: Option<CodeAddress>,
    skew: bool,
    help: bool,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            kind: SmashKind::Jmp,
            target: CodeAddress::new(0x1000),
            cond: ConditionCode::LessThan,
            patch: None,
            skew: false,
            help: false,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    smash::logging::init()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli_args(&args).map_err(io::Error::other)?;
    if cli.help {
        print_usage();
        return Ok(());
    }

    let mut cb = CodeBuffer::with_capacity(4096)?;
    if cli.skew {
        cb.emit_u32(NOP_WORD)?;
    }

    let start = match cli.kind {
        SmashKind::Call => AArch64::emit_call(&mut cb, cli.target)?,
        SmashKind::Jmp => AArch64::emit_jmp(&mut cb, cli.target)?,
        SmashKind::Jcc => AArch64::emit_jcc(&mut cb, cli.target, cli.cond)?,
        SmashKind::Movq | SmashKind::Cmpq => unreachable!("rejected while parsing --kind"),
    };
    print_listing(&cb, cli.kind, start)?;

    if let Some(new_target) = cli.patch {
        cb.smash(cli.kind, start, new_target)?;
        info!(kind = %cli.kind, start = %start, target = %new_target, "smashed sequence");
        print_listing(&cb, cli.kind, start)?;
    }
    Ok(())
}

fn print_listing(cb: &CodeBuffer, kind: SmashKind, start: CodeAddress) -> io::Result<()> {
    let listing = format_sequence(cb, kind, start)
        .ok_or_else(|| io::Error::other(format!("no smashable {kind} decodes at {start}")))?;
    print!("{listing}");
    Ok(())
}

fn parse_cli_args(args: &[String]) -> Result<DumpConfig, String> {
    let mut cfg = DumpConfig::default();
    let mut index = 0usize;

    while index < args.len() {
        match args[index].as_str() {
            "-h" | "--help" => {
                cfg.help = true;
                index += 1;
            }
            "--skew" => {
                cfg.skew = true;
                index += 1;
            }
            "--kind" => {
                cfg.kind = parse_kind(flag_value(args, index, "--kind")?)?;
                index += 2;
            }
            "--cond" => {
                cfg.cond = flag_value(args, index, "--cond")?.parse()?;
                index += 2;
            }
            "--target" => {
                cfg.target = parse_address(flag_value(args, index, "--target")?)?;
                index += 2;
            }
            "--patch" => {
                cfg.patch = Some(parse_address(flag_value(args, index, "--patch")?)?);
                index += 2;
            }
            other => return Err(format!("unknown argument '{other}'")),
        }
    }
    Ok(cfg)
}

fn parse_kind(text: &str) -> Result<SmashKind, String> {
    match text.parse::<SmashKind>()? {
        kind @ (SmashKind::Call | SmashKind::Jmp | SmashKind::Jcc) => Ok(kind),
        kind => Err(format!("{kind} sequences cannot be emitted on {}", AArch64::NAME)),
    }
}

fn flag_value<'a>(args: &'a [String], index: usize, flag: &str) -> Result<&'a str, String> {
    args.get(index + 1)
        .map(String::as_str)
        .ok_or_else(|| format!("missing value for {flag}"))
}

fn parse_address(text: &str) -> Result<CodeAddress, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => text.parse::<usize>(),
    };
    parsed
        .map(CodeAddress::new)
        .map_err(|err| format!("invalid address '{text}': {err}"))
}

fn print_usage() {
    println!("Usage:");
    println!("  pd-smash-dump [--kind call|jmp|jcc] [--target <addr>] [--cond <cc>]");
    println!("                [--patch <addr>] [--skew]");
    println!();
    println!("  --kind    sequence to emit (default jmp)");
    println!("  --target  initial target, hex with 0x or decimal (default 0x1000)");
    println!("  --cond    jcc condition: o no b ae e ne be a s ns l ge le g (default l)");
    println!("  --patch   smash the sequence to this target and list it again");
    println!("  --skew    emit one nop first so the padded layout is shown");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn defaults_to_unpadded_jmp() {
        let cfg = parse_cli_args(&[]).expect("empty args should parse");
        assert_eq!(cfg, DumpConfig::default());
    }

    #[test]
    fn parses_all_flags() {
        let cfg = parse_cli_args(&args(&[
            "--kind", "jcc", "--target", "0x3000", "--cond", "ge", "--patch", "8192", "--skew",
        ]))
        .expect("flags should parse");
        assert_eq!(cfg.kind, SmashKind::Jcc);
        assert_eq!(cfg.target, CodeAddress::new(0x3000));
        assert_eq!(cfg.cond, ConditionCode::GreaterEqual);
        assert_eq!(cfg.patch, Some(CodeAddress::new(0x2000)));
        assert!(cfg.skew);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(parse_cli_args(&args(&["--kind"])).is_err());
        assert!(parse_cli_args(&args(&["--kind", "ret"])).is_err());
        assert!(parse_cli_args(&args(&["--kind", "movq"])).is_err());
        assert!(parse_cli_args(&args(&["--kind", "cmpq"])).is_err());
        assert!(parse_cli_args(&args(&["--target", "0xZZ"])).is_err());
        assert!(parse_cli_args(&args(&["--bogus"])).is_err());
    }
}
