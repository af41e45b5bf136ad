// Machine façade: the single `call` entry point through which a store runs a
// function of an instance, whichever engine executes it.

use std::sync::Arc;

use crate::compiler::{CompiledModule, Resolution};
use crate::interpreter::{InterpState, Interpreter};
use crate::runtime::Store;
use crate::vm::{ExecState, Executor, LoadedUnit};
use crate::wasm::{InstanceId, Value};
use crate::{Result, Trap};

/// Why an engine handed control back to the driver.
pub(crate) enum Exit {
    /// The call the engine was started with returned.
    Return(Vec<Value>),
    /// The running frame calls a same-instance function owned by the other
    /// engine.
    Call(u32, Vec<Value>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Compiled,
    Interpreted,
}

enum Step {
    Start(u32, Vec<Value>),
    Resume(Vec<Value>),
}

/// Run `func` of a compiled instance. Calls between its compiled and
/// interpreted functions alternate between the two engines here rather than
/// nesting, so mixed recursion is bounded by the store's call depth alone.
pub(crate) fn drive(
    store: &mut Store,
    instance: InstanceId,
    units: &[Arc<LoadedUnit>],
    dispatch: &[Vec<u32>],
    func: u32,
    args: &[Value],
) -> std::result::Result<Vec<Value>, Trap> {
    let depth = store.depth;
    let result = alternate(store, instance, units, dispatch, func, args);
    store.depth = depth;
    result
}

fn alternate(
    store: &mut Store,
    instance: InstanceId,
    units: &[Arc<LoadedUnit>],
    dispatch: &[Vec<u32>],
    func: u32,
    args: &[Value],
) -> std::result::Result<Vec<Value>, Trap> {
    let mut compiled = ExecState::default();
    let mut interpreted = InterpState::default();
    // engine of every unfinished call, innermost last
    let mut sides = vec![Side::Compiled];
    let mut step = Step::Start(func, args.to_vec());

    loop {
        let Some(&side) = sides.last() else {
            return Err(Trap::Host("no active call".to_string()));
        };
        let exit = match side {
            Side::Compiled => {
                let state = std::mem::take(&mut compiled);
                let mut exec = Executor::attach(store, instance, units, dispatch, state);
                let exit = match step {
                    Step::Start(func, args) => exec.start(func, &args),
                    Step::Resume(results) => exec.resume_with(&results),
                }?;
                compiled = exec.detach();
                exit
            }
            Side::Interpreted => {
                let module = Arc::clone(&store.live(instance)?.module);
                let state = std::mem::take(&mut interpreted);
                let mut interp = Interpreter::attach(store, instance, module, state);
                let exit = match step {
                    Step::Start(func, args) => interp.start(func, &args),
                    Step::Resume(results) => interp.resume_with(&results),
                }?;
                interpreted = interp.detach();
                exit
            }
        };

        match exit {
            Exit::Return(results) => {
                sides.pop();
                if sides.is_empty() {
                    return Ok(results);
                }
                step = Step::Resume(results);
            }
            Exit::Call(callee, args) => {
                sides.push(match side {
                    Side::Compiled => Side::Interpreted,
                    Side::Interpreted => Side::Compiled,
                });
                step = Step::Start(callee, args);
            }
        }
    }
}

pub trait Machine: Send + Sync {
    /// Run function `func` of `instance` with already type-checked `args`.
    fn call(
        &self,
        store: &mut Store,
        instance: InstanceId,
        func: u32,
        args: &[Value],
    ) -> std::result::Result<Vec<Value>, Trap>;

    /// Whether `func` runs in the interpreter.
    fn interprets(&self, func: u32) -> bool;
}

/// Runs compiled code units; interpreted and imported indices are reached
/// through their delegation stubs.
pub struct AotMachine {
    compiled: Arc<CompiledModule>,
    units: Vec<Arc<LoadedUnit>>,
}

impl AotMachine {
    /// Load every unit of `compiled` once, up front.
    pub fn new(compiled: Arc<CompiledModule>) -> Result<Self> {
        let units = compiled
            .units()
            .iter()
            .map(|unit| unit.load().map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { compiled, units })
    }

    #[must_use]
    pub fn compiled(&self) -> &Arc<CompiledModule> {
        &self.compiled
    }
}

impl Machine for AotMachine {
    fn call(
        &self,
        store: &mut Store,
        instance: InstanceId,
        func: u32,
        args: &[Value],
    ) -> std::result::Result<Vec<Value>, Trap> {
        drive(store, instance, &self.units, self.compiled.dispatch(), func, args)
    }

    fn interprets(&self, func: u32) -> bool {
        self.compiled.resolution(func) == Some(Resolution::Interpreted)
    }
}

/// Runs every defined function in the interpreter.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterpreterMachine;

impl Machine for InterpreterMachine {
    fn call(
        &self,
        store: &mut Store,
        instance: InstanceId,
        func: u32,
        args: &[Value],
    ) -> std::result::Result<Vec<Value>, Trap> {
        crate::interpreter::execute(store, instance, func, args)
    }

    fn interprets(&self, _func: u32) -> bool {
        true
    }
}
