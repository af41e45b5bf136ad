use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use wasm_aot::{
    CompileOptions, Engine, FallbackPolicy, Imports, Module, Resolution, Store, Value, ValueKind,
};

#[derive(Parser)]
#[command(name = "wasm-aot")]
#[command(about = "Ahead-of-time WASM compiler with interpreter fallback")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile every function and report how each index resolves.
    Compile {
        #[arg(help = "Input WASM or WAT file")]
        input: PathBuf,

        #[arg(
            long,
            default_value = "fail",
            help = "What to do with functions over the code unit limit (fail, warn, silent)"
        )]
        fallback: FallbackPolicy,

        #[arg(long = "interpret", value_name = "INDEX", help = "Always interpret this function")]
        interpret: Vec<u32>,

        #[arg(long, help = "Code unit size limit in bytes")]
        max_code_size: Option<usize>,

        #[arg(long, help = "Print the report as JSON")]
        json: bool,
    },

    /// Print the normalized instructions of one function.
    Analyze {
        #[arg(help = "Input WASM or WAT file")]
        input: PathBuf,

        #[arg(short, long, help = "Function index")]
        function: u32,
    },

    /// Instantiate a module and call one of its exports.
    Run {
        #[arg(help = "Input WASM or WAT file")]
        input: PathBuf,

        #[arg(long, help = "Exported function to call")]
        invoke: String,

        #[arg(
            allow_negative_numbers = true,
            help = "Arguments, parsed by the function's parameter types"
        )]
        args: Vec<String>,

        #[arg(long, help = "Run in the interpreter instead of compiling")]
        interpreter: bool,

        #[arg(
            long,
            default_value = "fail",
            help = "Fallback policy when compiling (fail, warn, silent)"
        )]
        fallback: FallbackPolicy,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(None))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Compile {
            input,
            fallback,
            interpret,
            max_code_size,
            json,
        } => {
            let module = Arc::new(read_module(&input)?);
            let mut options = CompileOptions::default()
                .with_fallback(fallback)
                .with_interpreted_functions(interpret);
            if let Some(limit) = max_code_size {
                options = options.with_max_code_size(limit);
            }

            let compiled = wasm_aot::compile(&module, &options).context("Compilation failed")?;
            let stats = compiled.stats();

            if json {
                let functions: Vec<serde_json::Value> = compiled
                    .units()
                    .iter()
                    .zip(compiled.resolutions())
                    .map(|(unit, resolution)| {
                        serde_json::json!({
                            "index": unit.function,
                            "name": module.function_name(unit.function),
                            "resolution": resolution_name(*resolution),
                            "size": unit.size(),
                            "max_stack": unit.max_stack,
                        })
                    })
                    .collect();
                let report = serde_json::json!({
                    "input": input.display().to_string(),
                    "compiled": stats.compiled,
                    "interpreted": stats.interpreted,
                    "host": stats.host,
                    "code_size": stats.code_size,
                    "functions": functions,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for (unit, resolution) in compiled.units().iter().zip(compiled.resolutions()) {
                    let name = module.function_name(unit.function).unwrap_or("-");
                    println!(
                        "{:>6}  {:<11}  {:>6} bytes  {}",
                        unit.function,
                        resolution_name(*resolution),
                        unit.size(),
                        name
                    );
                }
                println!(
                    "Compiled {}: {} compiled, {} interpreted, {} host ({} bytes)",
                    input.display(),
                    stats.compiled,
                    stats.interpreted,
                    stats.host,
                    stats.code_size
                );
            }
        }
        Commands::Analyze { input, function } => {
            let module = read_module(&input)?;
            if function < module.import_count() || function >= module.function_count() {
                bail!(
                    "function {function} is not a defined function (imports: {}, functions: {})",
                    module.import_count(),
                    module.function_count()
                );
            }
            let code = wasm_aot::analysis::Analyzer::new(&module)
                .analyze(function)
                .context("Analysis failed")?;
            for ins in code {
                println!("{ins}");
            }
        }
        Commands::Run {
            input,
            invoke,
            args,
            interpreter,
            fallback,
        } => {
            let module = Arc::new(read_module(&input)?);
            let func = module
                .exported_function(&invoke)
                .with_context(|| format!("No exported function named {invoke}"))?;
            let ty = module
                .function_type(func)
                .with_context(|| format!("Function {func} has no type"))?;
            if ty.params.len() != args.len() {
                bail!("{invoke} expects {} arguments, got {}", ty.params.len(), args.len());
            }
            let values = ty
                .params
                .iter()
                .zip(&args)
                .map(|(kind, arg)| parse_value(*kind, arg))
                .collect::<Result<Vec<_>>>()?;

            let engine = if interpreter {
                Engine::Interpreted
            } else {
                Engine::Compiled(CompileOptions::default().with_fallback(fallback))
            };
            let mut store = Store::new();
            let id = store
                .instantiate(&module, &Imports::new(), &engine)
                .context("Instantiation failed")?;
            tracing::debug!(export = %invoke, function = func, "invoking");
            let results = store.invoke(id, &invoke, &values)?;
            for value in results {
                println!("{}", format_value(value));
            }
        }
    }

    Ok(())
}

/// Warnings, including the interpreter fallback notice, are shown unless
/// `RUST_LOG` (or `directives`) says otherwise.
fn log_filter(directives: Option<&str>) -> EnvFilter {
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::WARN.into());
    match directives {
        Some(directives) => builder.parse_lossy(directives),
        None => builder.from_env_lossy(),
    }
}

fn read_module(path: &Path) -> Result<Module> {
    let contents = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;

    let wasm = if path.extension().is_some_and(|e| e == "wat") {
        wat::parse_bytes(&contents)
            .map(std::borrow::Cow::into_owned)
            .map_err(|e| anyhow::anyhow!("WAT parse error: {e}"))?
    } else {
        contents
    };
    Module::parse(&wasm).with_context(|| format!("Failed to decode {}", path.display()))
}

fn resolution_name(resolution: Resolution) -> &'static str {
    match resolution {
        Resolution::Compiled => "compiled",
        Resolution::Interpreted => "interpreted",
        Resolution::Host => "host",
    }
}

fn parse_value(kind: ValueKind, arg: &str) -> Result<Value> {
    let value = match kind {
        ValueKind::I32 => Value::I32(parse_int(arg)?),
        ValueKind::I64 => Value::I64(parse_int(arg)?),
        ValueKind::F32 => {
            Value::from_f32(arg.parse().with_context(|| format!("invalid f32 {arg}"))?)
        }
        ValueKind::F64 => {
            Value::from_f64(arg.parse().with_context(|| format!("invalid f64 {arg}"))?)
        }
        ValueKind::FuncRef | ValueKind::ExternRef => {
            bail!("reference arguments cannot be passed from the command line")
        }
    };
    Ok(value)
}

/// Signed decimal, or unsigned when the value only fits the unsigned range
/// (`4294967295` is `-1i32`).
fn parse_int<T>(arg: &str) -> Result<T>
where
    T: std::str::FromStr + TryFrom<i128>,
{
    if let Ok(v) = arg.parse::<T>() {
        return Ok(v);
    }
    let wide: i128 = arg
        .parse()
        .with_context(|| format!("invalid integer {arg}"))?;
    let bits = std::mem::size_of::<T>() * 8;
    let unsigned_max = (1i128 << bits) - 1;
    if (0..=unsigned_max).contains(&wide) {
        let wrapped = wide - (1i128 << bits);
        return T::try_from(wrapped).map_err(|_| anyhow::anyhow!("integer out of range: {arg}"));
    }
    bail!("integer out of range: {arg}")
}

fn format_value(value: Value) -> String {
    match value {
        Value::I32(v) => format!("{v}: i32"),
        Value::I64(v) => format!("{v}: i64"),
        Value::F32(_) => format!("{}: f32", value.as_f32().unwrap_or(f32::NAN)),
        Value::F64(_) => format!("{}: f64", value.as_f64().unwrap_or(f64::NAN)),
        Value::FuncRef(None) | Value::ExternRef(None) => "null".to_string(),
        Value::FuncRef(Some(r)) => format!("funcref {}:{}", r.instance.0, r.index),
        Value::ExternRef(Some(v)) => format!("externref {v}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_int_accepts_unsigned_spelling() {
        assert_eq!(parse_int::<i32>("-5").expect("int"), -5);
        assert_eq!(parse_int::<i32>("4294967295").expect("int"), -1);
        assert_eq!(parse_int::<i64>("18446744073709551615").expect("int"), -1);
        assert!(parse_int::<i32>("4294967296").is_err());
        assert!(parse_int::<i32>("ten").is_err());
    }

    #[test]
    fn test_parse_value_by_kind() {
        assert_eq!(parse_value(ValueKind::F64, "2.5").expect("f64"), Value::from_f64(2.5));
        assert!(parse_value(ValueKind::FuncRef, "0").is_err());
    }

    #[test]
    fn test_warnings_are_shown_by_default() {
        assert_eq!(log_filter(Some("")).max_level_hint(), Some(LevelFilter::WARN));
        assert_eq!(
            log_filter(Some("wasm_aot=debug")).max_level_hint(),
            Some(LevelFilter::DEBUG)
        );
    }

    #[test]
    fn test_cli_parses_fallback_policy() {
        let cli = Cli::try_parse_from(["wasm-aot", "compile", "m.wat", "--fallback", "warn"])
            .expect("parse");
        let Commands::Compile { fallback, .. } = cli.command else {
            panic!("expected compile");
        };
        assert_eq!(fallback, FallbackPolicy::Warn);
        assert!(
            Cli::try_parse_from(["wasm-aot", "compile", "m.wat", "--fallback", "loud"]).is_err()
        );
    }
}
