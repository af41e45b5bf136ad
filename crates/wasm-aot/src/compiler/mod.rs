// Module compiler: decides once, per function index, whether calls resolve
// to a compiled code unit, the interpreter or an import, and builds the units.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::analysis::Analyzer;
use crate::codegen::{Delegate, emit_delegation, emit_function};
use crate::vm::CodeUnit;
use crate::wasm::{FunctionType, Module};
use crate::{Error, Result, describe_function};

/// Largest code unit the target machine accepts, in bytes.
pub const MAX_CODE_SIZE: usize = 65_535;

/// What to do with a function whose code unit exceeds the size limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    /// Reject the module.
    #[default]
    Fail,
    /// Run the function in the interpreter and log a warning.
    Warn,
    /// Run the function in the interpreter without a diagnostic.
    Silent,
}

impl std::str::FromStr for FallbackPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "warn" => Ok(Self::Warn),
            "silent" => Ok(Self::Silent),
            other => Err(Error::InvalidConfig(format!(
                "unknown fallback policy '{other}' (expected fail, warn or silent)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    pub fallback: FallbackPolicy,
    /// Functions that always run in the interpreter, whatever their size.
    pub interpreted_functions: BTreeSet<u32>,
    pub max_code_size: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            fallback: FallbackPolicy::Fail,
            interpreted_functions: BTreeSet::new(),
            max_code_size: MAX_CODE_SIZE,
        }
    }
}

impl CompileOptions {
    #[must_use]
    pub fn with_fallback(mut self, fallback: FallbackPolicy) -> Self {
        self.fallback = fallback;
        self
    }

    #[must_use]
    pub fn with_interpreted_functions(mut self, functions: impl IntoIterator<Item = u32>) -> Self {
        self.interpreted_functions.extend(functions);
        self
    }

    #[must_use]
    pub fn with_max_code_size(mut self, max_code_size: usize) -> Self {
        self.max_code_size = max_code_size;
        self
    }

    /// An explicit interpreted set only combines with the `Fail` policy.
    pub fn validate(&self) -> Result<()> {
        if !self.interpreted_functions.is_empty() && self.fallback != FallbackPolicy::Fail {
            return Err(Error::InvalidConfig(
                "explicitly interpreted functions require the FAIL fallback policy".to_string(),
            ));
        }
        if self.max_code_size == 0 {
            return Err(Error::InvalidConfig("max_code_size must be positive".to_string()));
        }
        Ok(())
    }
}

/// Where calls to a function index go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Compiled,
    Interpreted,
    /// An import, resolved at instantiation.
    Host,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileStats {
    pub compiled: usize,
    pub interpreted: usize,
    pub host: usize,
    /// Bytes of code across all units, stubs included.
    pub code_size: usize,
}

/// Immutable result of compiling a module. Every function index owns a code
/// unit: compiled code, or a stub delegating to the interpreter or an import.
#[derive(Debug, Clone)]
pub struct CompiledModule {
    module: Arc<Module>,
    units: Vec<CodeUnit>,
    resolutions: Vec<Resolution>,
    dispatch: Vec<Vec<u32>>,
}

impl CompiledModule {
    #[must_use]
    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    #[must_use]
    pub fn units(&self) -> &[CodeUnit] {
        &self.units
    }

    #[must_use]
    pub fn unit(&self, func: u32) -> Option<&CodeUnit> {
        self.units.get(func as usize)
    }

    #[must_use]
    pub fn resolutions(&self) -> &[Resolution] {
        &self.resolutions
    }

    #[must_use]
    pub fn resolution(&self, func: u32) -> Option<Resolution> {
        self.resolutions.get(func as usize).copied()
    }

    /// Per type index, the sorted function indices whose type is
    /// structurally equal to it.
    #[must_use]
    pub fn dispatch(&self) -> &[Vec<u32>] {
        &self.dispatch
    }

    #[must_use]
    pub fn stats(&self) -> CompileStats {
        let mut stats = CompileStats::default();
        for resolution in &self.resolutions {
            match resolution {
                Resolution::Compiled => stats.compiled += 1,
                Resolution::Interpreted => stats.interpreted += 1,
                Resolution::Host => stats.host += 1,
            }
        }
        stats.code_size = self.units.iter().map(CodeUnit::size).sum();
        stats
    }
}

/// Compile every function of `module` according to `options`.
pub fn compile(module: &Arc<Module>, options: &CompileOptions) -> Result<CompiledModule> {
    options.validate()?;
    let count = module.function_count();
    if let Some(&func) = options.interpreted_functions.iter().find(|f| **f >= count) {
        return Err(Error::InvalidConfig(format!(
            "interpreted function {func} out of range ({count} functions)"
        )));
    }

    let analyzer = Analyzer::new(module);
    let mut units = Vec::with_capacity(count as usize);
    let mut resolutions = Vec::with_capacity(count as usize);

    for func in 0..count {
        let ty = module
            .function_type(func)
            .ok_or_else(|| Error::Internal(format!("function {func} has no type")))?;

        let (unit, resolution) = if func < module.import_count() {
            let unit = emit_delegation(func, ty, Delegate::Import, MAX_CODE_SIZE)?;
            (unit, Resolution::Host)
        } else if options.interpreted_functions.contains(&func) {
            let unit = emit_delegation(func, ty, Delegate::Interpreter, MAX_CODE_SIZE)?;
            (unit, Resolution::Interpreted)
        } else {
            compile_function(module, &analyzer, func, options)?
        };
        units.push(unit);
        resolutions.push(resolution);
    }

    let compiled = CompiledModule {
        dispatch: dispatch_tables(module),
        module: Arc::clone(module),
        units,
        resolutions,
    };
    let stats = compiled.stats();
    tracing::debug!(
        compiled = stats.compiled,
        interpreted = stats.interpreted,
        host = stats.host,
        code_size = stats.code_size,
        "compiled module"
    );
    Ok(compiled)
}

/// Compile one defined function, applying the fallback policy when its unit
/// is too large.
fn compile_function(
    module: &Module,
    analyzer: &Analyzer<'_>,
    func: u32,
    options: &CompileOptions,
) -> Result<(CodeUnit, Resolution)> {
    let code = analyzer.analyze(func)?;
    match emit_function(module, func, &code, options.max_code_size) {
        Ok(unit) => Ok((unit, Resolution::Compiled)),
        Err(Error::CodeTooLarge { size, limit, .. }) => {
            let name = module.function_name(func);
            match options.fallback {
                FallbackPolicy::Fail => {
                    return Err(Error::FallbackRequired {
                        function: func,
                        name: name.map(str::to_string),
                        size,
                        limit,
                    });
                }
                FallbackPolicy::Warn => {
                    tracing::warn!(
                        "using interpreted mode for {} ({size} bytes exceeds the {limit} byte code unit limit)",
                        describe_function(func, name)
                    );
                }
                FallbackPolicy::Silent => {}
            }
            let ty = module
                .function_type(func)
                .ok_or_else(|| Error::Internal(format!("function {func} has no type")))?;
            let unit = emit_delegation(func, ty, Delegate::Interpreter, MAX_CODE_SIZE)?;
            Ok((unit, Resolution::Interpreted))
        }
        Err(e) => Err(e),
    }
}

fn dispatch_tables(module: &Module) -> Vec<Vec<u32>> {
    // function indices ascend, so each list comes out sorted
    let mut by_type: HashMap<&FunctionType, Vec<u32>> = HashMap::new();
    for func in 0..module.function_count() {
        if let Some(ty) = module.function_type(func) {
            by_type.entry(ty).or_default().push(func);
        }
    }
    module
        .types
        .iter()
        .map(|ty| by_type.get(ty).cloned().unwrap_or_default())
        .collect()
}
