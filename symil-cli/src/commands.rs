//! CLI command implementations.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use symil_common::{Constant, Metadata, MethodId, Primitive, TypeId};
use symil_engine::convert::{is_reference, underlying};
use symil_engine::resolve::resolve;
use symil_engine::{Config, Engine, ExecutionState, Expr, ResolveMode};
use tracing::debug;

#[derive(Args)]
pub struct RunArgs {
    /// Assembly file
    pub file: PathBuf,

    /// Method to run, as `Type::Name`
    #[arg(long)]
    pub method: String,

    /// One per parameter, in order: a literal, `null`, `?name` for a
    /// symbolic input or `?name!` for a non-null input of exactly the
    /// parameter's type. Instance methods take the receiver first; it
    /// defaults to `?this!` when omitted.
    #[arg(long = "arg", allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Print every store binding as recorded, intermediate roots included
    #[arg(long)]
    pub full: bool,

    /// Maximum number of forks per run
    #[arg(long)]
    pub max_forks: Option<usize>,

    /// Maximum number of instructions per run
    #[arg(long)]
    pub max_steps: Option<usize>,
}

/// Symbolically execute a method and print its result, side effects and
/// final store.
pub fn run(args: &RunArgs) -> Result<(), i32> {
    let meta = read_metadata(&args.file)?;
    let method = find_method(&meta, &args.method)?;
    let inputs = call_arguments(&meta, method, &args.args).map_err(|e| {
        eprintln!("error: {e}");
        1
    })?;

    let mut config = Config::default();
    if let Some(n) = args.max_forks {
        config = config.with_max_paths(n);
    }
    if let Some(n) = args.max_steps {
        config = config.with_max_steps(n);
    }

    let engine = Engine::new(Arc::new(meta)).with_config(config);
    match engine.invoke(method, inputs) {
        Ok(state) => {
            print!("{}", report(&engine, method, &state, args.full));
            Ok(())
        }
        Err(e) => {
            eprintln!("engine error: {e}");
            Err(3)
        }
    }
}

/// Print the canonical text of an assembly file, or of one method body.
pub fn disasm(file: &Path, method: Option<&str>) -> Result<(), i32> {
    let meta = read_metadata(file)?;
    let Some(path) = method else {
        print!("{}", symil_assembler::disassemble(&meta));
        return Ok(());
    };
    let id = find_method(&meta, path)?;
    match &meta.method(id).implementation {
        symil_common::MethodImpl::Il(body) => {
            print!("{}", symil_assembler::disassemble_body(&meta, body));
            Ok(())
        }
        _ => {
            eprintln!("error: '{path}' has no instruction body");
            Err(1)
        }
    }
}

fn read_metadata(path: &Path) -> Result<Metadata, i32> {
    let text = fs::read_to_string(path).map_err(|e| {
        eprintln!("error: cannot read '{}': {e}", path.display());
        1
    })?;
    let meta = symil_assembler::assemble(&text).map_err(|e| {
        eprintln!("error: {e}");
        1
    })?;
    debug!(file = %path.display(), types = meta.type_count(), "assembled");
    Ok(meta)
}

fn find_method(meta: &Metadata, path: &str) -> Result<MethodId, i32> {
    symil_assembler::lookup_method(meta, path).ok_or_else(|| {
        eprintln!("error: no method '{path}' (unknown or overloaded)");
        1
    })
}

/// Builds the argument list for `method`, receiver first.
fn call_arguments(meta: &Metadata, method: MethodId, raw: &[String]) -> Result<Vec<Expr>, String> {
    let def = meta.method(method);
    let mut types: Vec<TypeId> = def.params.iter().map(|p| p.ty).collect();
    let mut out = Vec::with_capacity(types.len() + 1);
    if !def.is_static {
        if raw.len() == types.len() {
            out.push(Expr::root_tagged(def.declaring, "this", true, true));
        } else {
            types.insert(0, def.declaring);
        }
    }
    if raw.len() != types.len() {
        return Err(format!(
            "{} takes {} argument(s), got {}",
            meta.method_name(method),
            types.len(),
            raw.len()
        ));
    }
    for (ty, text) in types.into_iter().zip(raw) {
        out.push(parse_argument(meta, ty, text)?);
    }
    Ok(out)
}

fn parse_argument(meta: &Metadata, ty: TypeId, text: &str) -> Result<Expr, String> {
    if let Some(name) = text.strip_prefix('?') {
        let (name, exact) = match name.strip_suffix('!') {
            Some(n) => (n, true),
            None => (name, false),
        };
        if name.is_empty() {
            return Err(format!("'{text}': a symbolic input needs a name"));
        }
        return Ok(if exact {
            Expr::root_tagged(ty, name, true, true)
        } else {
            Expr::root(ty, name)
        });
    }
    if text == "null" && is_reference(meta, ty) {
        return Ok(Expr::null(ty));
    }
    if ty == TypeId::STRING {
        let s = text
            .strip_prefix('"')
            .and_then(|t| t.strip_suffix('"'))
            .unwrap_or(text);
        return Ok(Expr::constant(Constant::str(s)));
    }
    let prim = underlying(meta, ty).ok_or_else(|| {
        format!("'{text}': {} has no literal form, use ?name", meta.type_name(ty))
    })?;
    let bad = || format!("'{text}' is not a valid {}", meta.type_name(ty));
    let value = match prim {
        Primitive::Bool => Constant::Bool(text.parse().map_err(|_| bad())?),
        Primitive::F32 | Primitive::F64 => {
            Constant::from_f64(prim, text.parse().map_err(|_| bad())?)
        }
        Primitive::Char => {
            let mut chars = text.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Constant::from_i64(prim, i64::from(u32::from(c))),
                _ => return Err(bad()),
            }
        }
        _ => Constant::from_i64(prim, parse_integer(text).ok_or_else(bad)?),
    };
    Ok(if ty.primitive().is_some() {
        Expr::constant(value)
    } else {
        Expr::typed_constant(value, ty)
    })
}

fn parse_integer(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let magnitude = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<u64>().ok()?,
    };
    if negative {
        0i64.checked_sub_unsigned(magnitude)
    } else {
        // u64 values above i64::MAX keep their bit pattern
        Some(magnitude as i64)
    }
}

/// Human-readable summary of a finished call.
///
/// The store lists heap writes with their values fully resolved, or with
/// `all_bindings` every root binding as recorded.
fn report(engine: &Engine, method: MethodId, state: &ExecutionState, all_bindings: bool) -> String {
    let meta = engine.meta();
    let mut out = String::new();
    if state.is_thrown() {
        out.push_str("result: <throws>\n");
    } else if meta.method(method).ret == TypeId::VOID {
        out.push_str("result: <void>\n");
    } else if let Some(value) = engine.result(state) {
        let _ = writeln!(out, "result: {}", value.render(meta));
    }

    if !state.side_effects().is_empty() {
        out.push_str("side effects:\n");
        for effect in state.side_effects() {
            match &effect.guard {
                Some(guard) => {
                    let _ = writeln!(out, "  if {}: {}", guard.render(meta), effect.effect.render(meta));
                }
                None => {
                    let _ = writeln!(out, "  {}", effect.effect.render(meta));
                }
            }
        }
    }

    let bindings: Vec<(&Expr, Expr)> = state
        .locations()
        .into_iter()
        .filter(|l| match l.as_placeholder() {
            Some(p) => all_bindings && p.is_root(),
            None => true,
        })
        .filter_map(|l| {
            let value = state.read(l)?;
            let value = if all_bindings {
                value.clone()
            } else {
                resolve(value, state, meta, ResolveMode::Full)
            };
            Some((l, value))
        })
        .collect();
    if !bindings.is_empty() {
        out.push_str("store:\n");
        for (location, value) in bindings {
            let _ = writeln!(out, "  {} = {}", location.render(meta), value.render(meta));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
.enum Mode u8
  .field static literal Mode On = 1
.end

.class Counter
  .field i32 count
  .method void Bump(i32 by)
    ldarg.0
    ldarg.0
    ldfld Counter::count
    ldarg by
    add
    stfld Counter::count
    ret
  .end
  .method static i32 Pick(Mode m, char c, string s, f64 d)
    ldc.i4.0
    ret
  .end
.end
";

    fn meta() -> Metadata {
        symil_assembler::assemble(SAMPLE).unwrap()
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn integer_literals() {
        assert_eq!(parse_integer("42"), Some(42));
        assert_eq!(parse_integer("-0x10"), Some(-16));
        assert_eq!(parse_integer("18446744073709551615"), Some(-1));
        assert_eq!(parse_integer("12a"), None);
    }

    #[test]
    fn arguments_follow_parameter_types() {
        let meta = meta();
        let pick = symil_assembler::lookup_method(&meta, "Counter::Pick").unwrap();
        let args = call_arguments(&meta, pick, &strings(&["1", "x", "\"hi\"", "0.5"])).unwrap();
        let mode = meta.type_by_name("Mode").unwrap();
        assert_eq!(args[0], Expr::typed_constant(Constant::U8(1), mode));
        assert_eq!(args[1], Expr::constant(Constant::Char(u16::from(b'x'))));
        assert_eq!(args[2], Expr::constant(Constant::str("hi")));
        assert_eq!(args[3], Expr::constant(Constant::F64(0.5)));
    }

    #[test]
    fn receiver_defaults_to_an_exact_root() {
        let meta = meta();
        let bump = symil_assembler::lookup_method(&meta, "Counter::Bump").unwrap();
        let args = call_arguments(&meta, bump, &strings(&["?n"])).unwrap();
        let this = args[0].as_placeholder().unwrap();
        assert!(this.is_root() && this.is_exact_type() && this.is_not_null());
        assert_eq!(this.name(), "this");

        let explicit = call_arguments(&meta, bump, &strings(&["null", "3"])).unwrap();
        assert!(explicit[0].is_null_constant());
    }

    #[test]
    fn argument_errors() {
        let meta = meta();
        let pick = symil_assembler::lookup_method(&meta, "Counter::Pick").unwrap();
        assert!(call_arguments(&meta, pick, &strings(&["1"])).is_err());
        assert!(call_arguments(&meta, pick, &strings(&["1", "xy", "s", "0"])).is_err());
        assert!(parse_argument(&meta, TypeId::I32, "?").is_err());
        assert!(parse_argument(&meta, TypeId::BOOL, "yes").is_err());
    }

    #[test]
    fn report_lists_store_writes() {
        let meta = Arc::new(meta());
        let bump = symil_assembler::lookup_method(&meta, "Counter::Bump").unwrap();
        let engine = Engine::new(Arc::clone(&meta));
        let args = call_arguments(&meta, bump, &strings(&["?n"])).unwrap();
        let state = engine.invoke(bump, args).unwrap();
        let text = report(&engine, bump, &state, false);
        assert!(text.starts_with("result: <void>\n"), "{text}");
        // the old value is captured before the write
        assert!(text.contains("side effects:\n  %__envPar"), "{text}");
        assert!(text.contains("store:\n  %this.count = (%__envPar"), "{text}");
        assert!(text.ends_with(" + %n)\n"), "{text}");

        let raw = report(&engine, bump, &state, true);
        assert!(raw.contains("  %this.count = %__setPar"), "{raw}");
    }
}
