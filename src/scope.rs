//! The reactive scope graph: the tree of mutable contexts, the watcher
//! store, the digest fixed-point scheduler, and the event bus (spec
//! §4.6-§4.10). This is the single largest component — the compiler
//! produces [`crate::compiler::CompiledExpr`]s; everything here is about
//! *when* they get re-evaluated and what happens when they change.

use crate::compiler::{Compiler, WatchDelegate};
use crate::error::{DigestError, EngineError, EvalError};
use crate::filter::FilterRegistry;
use crate::value::{Mapping, Value};
use log::error;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

const DEFAULT_TTL: u32 = 10;

/// Injectable error sink for the five "caught and logged" exception
/// points the digest loop has (spec §9 open question: "inject a sink
/// interface rather than hard-coding a console").
pub trait ErrorSink {
    fn on_error(&self, error: &str, context: &str);
}

/// Default sink: routes to the `log` crate at `error` level.
pub struct LoggingErrorSink;

impl ErrorSink for LoggingErrorSink {
    fn on_error(&self, error: &str, context: &str) {
        error!("{context}: {error}");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Digest,
    Apply,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Digest => "$digest",
            Phase::Apply => "$apply",
        }
    }
}

/// A deferred callable used by `$evalAsync`/`$applyAsync`/`$$postDigest`.
pub type Task = Rc<dyn Fn(&Scope) -> Result<Value, EvalError>>;

/// An event bus listener. Exceptions are caught and routed to the sink
/// (spec §4.10).
pub type EventListener = Rc<dyn Fn(&Event, &[Value]) -> Result<(), EvalError>>;

/// A watch listener: `(newValue, oldValue, scope)`. Exceptions are caught
/// and routed to the sink (spec §4.7 step 3).
pub type WatchListener = Rc<dyn Fn(&Value, &Value, &Scope) -> Result<(), EvalError>>;

/// Either a compiled expression or a pre-built native watch function
/// (spec §4.6: "watchExpr may already be a callable ... or a string").
#[derive(Clone)]
pub enum WatchSource {
    Expr(Rc<crate::compiler::CompiledExpr>),
    Native(Rc<dyn Fn(&Scope) -> Value>),
}

impl WatchSource {
    fn delegate(&self) -> Option<WatchDelegate> {
        match self {
            WatchSource::Expr(e) => e.watch_delegate,
            WatchSource::Native(_) => None,
        }
    }

    fn eval(&self, scope: &Scope, sink: &dyn ErrorSink) -> Value {
        match self {
            WatchSource::Expr(e) => match e.eval(scope, None) {
                Ok(v) => v,
                Err(err) => {
                    sink.on_error(&err.to_string(), "watch");
                    Value::Undefined
                }
            },
            WatchSource::Native(f) => f(scope),
        }
    }
}

struct Watcher {
    watch: RefCell<WatchSource>,
    listener: Option<WatchListener>,
    value_eq: bool,
    last: RefCell<Option<Value>>,
    alive: Cell<bool>,
    /// For the inputs delegate: cached per-input last values.
    input_cache: RefCell<Vec<Value>>,
}

impl Watcher {
    fn matches(&self, candidate: &Value, new_value: &Value) -> bool {
        if self.value_eq {
            candidate.structural_eq(new_value)
        } else {
            candidate.reference_eq(new_value)
        }
    }
}

/// Destructor returned by `$watch`/`$on`-family registrations.
pub struct Destructor(Box<dyn FnOnce()>);

impl Destructor {
    pub fn run(self) {
        (self.0)()
    }
}

/// The event record passed to `$on` listeners (spec §4.10). The same
/// instance is shared across every target during one `$emit`/`$broadcast`.
pub struct Event {
    pub name: String,
    pub target_scope: Scope,
    current_scope: RefCell<Option<Scope>>,
    stop_propagation_flag: Cell<bool>,
    default_prevented: Cell<bool>,
    honours_stop_propagation: bool,
}

impl Event {
    pub fn current_scope(&self) -> Option<Scope> {
        self.current_scope.borrow().clone()
    }

    /// Only meaningful on `$emit` events; `$broadcast` events ignore it.
    pub fn stop_propagation(&self) {
        self.stop_propagation_flag.set(true);
    }

    pub fn prevent_default(&self) {
        self.default_prevented.set(true);
    }

    pub fn default_prevented(&self) -> bool {
        self.default_prevented.get()
    }
}

struct RootState {
    phase: Cell<Option<Phase>>,
    last_dirty_watch: RefCell<Option<*const Watcher>>,
    apply_async_timer_scheduled: Cell<bool>,
    sink: Rc<dyn ErrorSink>,
    compiler: Compiler,
    ttl: u32,
}

struct ScopeInner {
    root: RefCell<Option<Rc<RootState>>>,
    parent: Option<Scope>,
    isolated: bool,
    properties: Rc<RefCell<Mapping>>,
    children: RefCell<Vec<Scope>>,
    watchers: RefCell<Vec<Rc<Watcher>>>,
    async_queue: Rc<RefCell<VecDeque<(Scope, Task)>>>,
    apply_async_queue: Rc<RefCell<VecDeque<(Scope, Task)>>>,
    post_digest_queue: Rc<RefCell<VecDeque<(Scope, Task)>>>,
    listeners: RefCell<HashMap<String, Vec<Option<EventListener>>>>,
    destroyed: Cell<bool>,
}

/// A node in the reactive scope tree. Cheap to clone (an `Rc` handle).
#[derive(Clone)]
pub struct Scope(Rc<ScopeInner>);

impl Scope {
    pub fn new_root() -> Scope {
        Scope::new_root_with_config(Rc::new(FilterRegistry::new()), None, DEFAULT_TTL)
    }

    pub fn new_root_with_config(filters: Rc<FilterRegistry>, root_object: Option<Value>, ttl: u32) -> Scope {
        let mut compiler = Compiler::new(filters);
        if let Some(root_object) = root_object {
            compiler = compiler.with_root_object(root_object);
        }
        let root_state = Rc::new(RootState {
            phase: Cell::new(None),
            last_dirty_watch: RefCell::new(None),
            apply_async_timer_scheduled: Cell::new(false),
            sink: Rc::new(LoggingErrorSink),
            compiler,
            ttl,
        });
        let scope = Scope(Rc::new(ScopeInner {
            root: RefCell::new(Some(root_state)),
            parent: None,
            isolated: false,
            properties: Rc::new(RefCell::new(Mapping::new())),
            children: RefCell::new(Vec::new()),
            watchers: RefCell::new(Vec::new()),
            async_queue: Rc::new(RefCell::new(VecDeque::new())),
            apply_async_queue: Rc::new(RefCell::new(VecDeque::new())),
            post_digest_queue: Rc::new(RefCell::new(VecDeque::new())),
            listeners: RefCell::new(HashMap::new()),
            destroyed: Cell::new(false),
        }));
        scope
    }

    /// Installs a custom error sink (spec §9 open question).
    pub fn with_error_sink(self, sink: Rc<dyn ErrorSink>) -> Scope {
        if let Some(root) = self.0.root.borrow().as_ref() {
            // Only meaningful on a freshly constructed root; replace its sink.
            let replacement = RootState {
                phase: Cell::new(root.phase.get()),
                last_dirty_watch: RefCell::new(None),
                apply_async_timer_scheduled: Cell::new(false),
                sink,
                compiler: root.compiler.clone(),
                ttl: root.ttl,
            };
            *self.0.root.borrow_mut() = Some(Rc::new(replacement));
        }
        self
    }

    fn root_state(&self) -> Rc<RootState> {
        self.0.root.borrow().as_ref().cloned().expect("scope always has a root once constructed")
    }

    fn sink(&self) -> Rc<dyn ErrorSink> {
        self.root_state().sink.clone()
    }

    /// `$root` (spec invariant: `s.$root === (s.$parent ? s.$parent.$root : s)`).
    pub fn root(&self) -> Scope {
        match &self.0.parent {
            Some(parent) => parent.root(),
            None => self.clone(),
        }
    }

    pub fn parent(&self) -> Option<Scope> {
        self.0.parent.clone()
    }

    pub fn is_root(&self) -> bool {
        self.0.parent.is_none()
    }

    pub fn is_isolated(&self) -> bool {
        self.0.isolated
    }

    pub fn properties(&self) -> Rc<RefCell<Mapping>> {
        self.0.properties.clone()
    }

    fn ptr_eq(&self, other: &Scope) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// `$new(isolate)` (spec §3 Lifecycle, §4.10 root inheritance).
    pub fn new_child(&self, isolate: bool) -> Scope {
        let child = Scope(Rc::new(ScopeInner {
            root: RefCell::new(Some(self.root_state())),
            parent: Some(self.clone()),
            isolated: isolate,
            properties: Rc::new(RefCell::new(Mapping::new())),
            children: RefCell::new(Vec::new()),
            watchers: RefCell::new(Vec::new()),
            async_queue: self.0.async_queue.clone(),
            apply_async_queue: self.0.apply_async_queue.clone(),
            post_digest_queue: self.0.post_digest_queue.clone(),
            listeners: RefCell::new(HashMap::new()),
            destroyed: Cell::new(false),
        }));
        self.0.children.borrow_mut().push(child.clone());
        child
    }

    /// `$destroy`: broadcasts `$destroy`, detaches from the parent, clears
    /// watchers and listeners (spec §3 Lifecycle, §4.10). No-op on the root.
    pub fn destroy(&self) {
        if self.is_root() || self.0.destroyed.get() {
            return;
        }
        self.broadcast("$destroy", Vec::new());
        if let Some(parent) = &self.0.parent {
            parent.0.children.borrow_mut().retain(|c| !c.ptr_eq(self));
        }
        self.0.watchers.borrow_mut().clear();
        self.0.listeners.borrow_mut().clear();
        self.0.destroyed.set(true);
    }

    // ---- identifier resolution (spec §9 "scope inheritance without prototypes") ----

    /// Chain lookup through non-isolated parents only.
    pub fn get(&self, name: &str) -> Value {
        if let Some(v) = self.0.properties.borrow().get(name) {
            return v.clone();
        }
        if self.0.isolated {
            return Value::Undefined;
        }
        match &self.0.parent {
            Some(parent) => parent.get(name),
            None => Value::Undefined,
        }
    }

    /// The innermost scope in the non-isolated chain (starting at `self`)
    /// that already owns `name`, or `self` if none does (spec §9: "writes
    /// always target the nearest scope that already owns the root of the
    /// path, or the current scope if none owns it").
    pub fn resolve_write_owner(&self, name: &str) -> Rc<RefCell<Mapping>> {
        let mut cursor = self.clone();
        loop {
            if cursor.0.properties.borrow().contains_key(name) {
                return cursor.0.properties.clone();
            }
            if cursor.0.isolated {
                return self.0.properties.clone();
            }
            match cursor.0.parent.clone() {
                Some(parent) => cursor = parent,
                None => return self.0.properties.clone(),
            }
        }
    }

    // ---- expression evaluation ----

    fn compiler(&self) -> Compiler {
        self.root_state().compiler.clone()
    }

    /// `$eval(expr, locals?)`.
    pub fn eval(&self, expr: &str, locals: Option<Value>) -> Result<Value, EngineError> {
        let compiled = self.compiler().compile(expr)?;
        Ok(compiled.eval(self, locals.as_ref())?)
    }

    /// `$apply(expr)`: runs in the "apply" phase then digests from root.
    pub fn apply(&self, expr: &str, locals: Option<Value>) -> Result<Value, EngineError> {
        self.enter_phase(Phase::Apply)?;
        let result = self.eval(expr, locals);
        self.clear_phase();
        let digest_result = self.root().digest();
        result.and_then(|v| digest_result.map(|_| v).map_err(EngineError::from))
    }

    fn enter_phase(&self, phase: Phase) -> Result<(), DigestError> {
        let root = self.root_state();
        if let Some(active) = root.phase.get() {
            return Err(DigestError::ReentrantPhase { phase: active.name() });
        }
        let _ = phase;
        root.phase.set(Some(phase));
        Ok(())
    }

    fn clear_phase(&self) {
        self.root_state().phase.set(None);
    }

    pub fn phase(&self) -> Option<Phase> {
        self.root_state().phase.get()
    }

    /// `$evalAsync(task)`.
    pub fn eval_async(&self, task: Task) {
        let was_empty = self.0.async_queue.borrow().is_empty();
        self.0.async_queue.borrow_mut().push_back((self.clone(), task));
        // §5 ordering guarantee 2: if no digest is running, a digest is
        // needed to drain this; since this crate has no host event loop,
        // the caller is expected to invoke `$digest` themselves. We still
        // track was_empty for symmetry with the spec's scheduling text.
        let _ = was_empty;
    }

    /// `$applyAsync(task)`: coalesces onto a shared queue; schedules one
    /// flush unless a timer is already pending.
    pub fn apply_async(&self, task: Task) {
        self.0.apply_async_queue.borrow_mut().push_back((self.clone(), task));
        self.root_state().apply_async_timer_scheduled.set(true);
    }

    /// `$$postDigest(task)`.
    pub fn post_digest(&self, task: Task) {
        self.0.post_digest_queue.borrow_mut().push_back((self.clone(), task));
    }

    /// Runs any pending coalesced `$applyAsync` tasks synchronously,
    /// as if their timer had fired (spec §4.7: "if root.applyAsyncTimer is
    /// set: cancel it, flush applyAsyncQueue synchronously").
    pub fn flush_apply_async(&self) {
        let root_state = self.root_state();
        if !root_state.apply_async_timer_scheduled.get() {
            return;
        }
        root_state.apply_async_timer_scheduled.set(false);
        let sink = root_state.sink.clone();
        loop {
            let next = self.0.apply_async_queue.borrow_mut().pop_front();
            let Some((scope, task)) = next else { break };
            if let Err(err) = task(&scope) {
                sink.on_error(&err.to_string(), "$applyAsync");
            }
        }
    }

    // ---- digest scheduler (spec §4.7) ----

    /// `$digest()`, always acting on the root's subtree regardless of which
    /// scope it is invoked on.
    pub fn digest(&self) -> Result<(), DigestError> {
        let root = self.root();
        root.run_digest()
    }

    fn run_digest(&self) -> Result<(), DigestError> {
        self.enter_phase(Phase::Digest)?;
        self.flush_apply_async();

        let root_state = self.root_state();
        let sink = root_state.sink.clone();
        let mut ttl = root_state.ttl;
        *root_state.last_dirty_watch.borrow_mut() = None;

        let result = loop {
            while let Some((scope, task)) = self.0.async_queue.borrow_mut().pop_front() {
                if let Err(err) = task(&scope) {
                    sink.on_error(&err.to_string(), "$evalAsync");
                }
            }

            let dirty = self.digest_once(&sink);
            ttl = ttl.saturating_sub(1);

            let async_pending = !self.0.async_queue.borrow().is_empty();
            if (dirty || async_pending) && ttl == 0 {
                break Err(DigestError::TtlExceeded);
            }
            if !dirty && !async_pending {
                break Ok(());
            }
        };

        self.clear_phase();

        if result.is_ok() {
            loop {
                let next = self.0.post_digest_queue.borrow_mut().pop_front();
                let Some((scope, task)) = next else { break };
                if let Err(err) = task(&scope) {
                    sink.on_error(&err.to_string(), "$$postDigest");
                }
            }
        }

        result
    }

    /// One pre-order walk of the subtree, reverse-order watcher iteration
    /// per scope, with the `lastDirtyWatch` short-circuit (spec §4.7).
    fn digest_once(&self, sink: &Rc<dyn ErrorSink>) -> bool {
        let stop = Cell::new(false);
        let dirty = Cell::new(false);
        self.digest_walk(sink, &stop, &dirty);
        dirty.get()
    }

    fn digest_walk(&self, sink: &Rc<dyn ErrorSink>, stop: &Cell<bool>, dirty: &Cell<bool>) {
        if stop.get() {
            return;
        }
        self.digest_scope_watchers(sink, stop, dirty);
        if stop.get() {
            return;
        }
        let children: Vec<Scope> = self.0.children.borrow().clone();
        for child in children {
            if stop.get() {
                return;
            }
            child.digest_walk(sink, stop, dirty);
        }
    }

    fn digest_scope_watchers(&self, sink: &Rc<dyn ErrorSink>, stop: &Cell<bool>, dirty: &Cell<bool>) {
        self.0.watchers.borrow_mut().retain(|w| w.alive.get());
        let root_state = self.root_state();
        let len = self.0.watchers.borrow().len();
        for i in (0..len).rev() {
            if stop.get() {
                return;
            }
            let watcher = match self.0.watchers.borrow().get(i) {
                Some(w) if w.alive.get() => w.clone(),
                _ => continue,
            };

            let new_value = self.evaluate_watcher(&watcher, sink);
            let changed = {
                let last = watcher.last.borrow();
                match last.as_ref() {
                    Some(last_value) => !watcher.matches(last_value, &new_value),
                    None => true,
                }
            };

            if changed {
                let old_value = {
                    let last = watcher.last.borrow();
                    match last.as_ref() {
                        Some(v) => v.clone(),
                        None => new_value.clone(),
                    }
                };
                let stored = if watcher.value_eq { new_value.deep_clone() } else { new_value.clone() };
                *watcher.last.borrow_mut() = Some(stored);
                *root_state.last_dirty_watch.borrow_mut() = Some(Rc::as_ptr(&watcher));
                dirty.set(true);

                if let Some(listener) = &watcher.listener {
                    if let Err(err) = listener(&new_value, &old_value, self) {
                        sink.on_error(&err.to_string(), "watch listener");
                    }
                }
            } else {
                let is_last_dirty =
                    root_state.last_dirty_watch.borrow().is_some_and(|p| p == Rc::as_ptr(&watcher));
                if is_last_dirty {
                    stop.set(true);
                    return;
                }
            }
        }
    }

    /// Evaluates a watcher's watch function, applying the inputs delegate's
    /// per-input short-circuit when applicable (spec §4.6 "inputs delegate").
    fn evaluate_watcher(&self, watcher: &Watcher, sink: &Rc<dyn ErrorSink>) -> Value {
        let source = watcher.watch.borrow();
        if let (WatchSource::Expr(expr), Some(WatchDelegate::Inputs)) = (&*source, source.delegate()) {
            if let Some(inputs) = &expr.inputs {
                let mut cache = watcher.input_cache.borrow_mut();
                let first_run = cache.is_empty();
                if first_run {
                    cache.resize(inputs.len(), Value::Undefined);
                }
                let mut any_changed = first_run;
                let mut fresh = Vec::with_capacity(inputs.len());
                for (i, input) in inputs.iter().enumerate() {
                    let v = match input.eval(self, None) {
                        Ok(v) => v,
                        Err(err) => {
                            sink.on_error(&err.to_string(), "watch input");
                            Value::Undefined
                        }
                    };
                    if !v.reference_eq(&cache[i]) {
                        any_changed = true;
                    }
                    fresh.push(v);
                }
                if !any_changed {
                    drop(cache);
                    return watcher.last.borrow().clone().unwrap_or(Value::Undefined);
                }
                *cache = fresh;
            }
        }
        source.eval(self, sink.as_ref())
    }

    // ---- watch registration (spec §4.6) ----

    /// New watchers are prepended (spec §4.6 "registration order
    /// invariant"). The returned destructor only flags the watcher dead —
    /// actual removal from the vector is deferred to the next time this
    /// scope's watchers are about to be walked, so indices never shift out
    /// from under a digest pass that is mid-iteration (see
    /// `digest_scope_watchers`).
    fn push_watcher(&self, watcher: Rc<Watcher>) -> Destructor {
        self.0.watchers.borrow_mut().insert(0, watcher.clone());
        let scope = self.clone();
        Destructor(Box::new(move || {
            watcher.alive.set(false);
            *scope.root_state().last_dirty_watch.borrow_mut() = None;
        }))
    }

    fn base_watcher(source: WatchSource, listener: Option<WatchListener>, value_eq: bool) -> Rc<Watcher> {
        Rc::new(Watcher {
            watch: RefCell::new(source),
            listener,
            value_eq,
            last: RefCell::new(None),
            alive: Cell::new(true),
            input_cache: RefCell::new(Vec::new()),
        })
    }

    /// `$watch(expr, listener?, valueEq?)` over a string expression,
    /// honouring any `$$watchDelegate` the compiled expression carries.
    pub fn watch(
        &self,
        expr: &str,
        listener: Option<WatchListener>,
        value_eq: bool,
    ) -> Result<Destructor, EngineError> {
        let compiled = Rc::new(self.compiler().compile(expr)?);
        Ok(self.watch_compiled(compiled, listener, value_eq))
    }

    /// `$watch` over an already-compiled expression or native watch
    /// function (spec §4.6: "watchExpr may already be a callable").
    pub fn watch_compiled(
        &self,
        compiled: Rc<crate::compiler::CompiledExpr>,
        listener: Option<WatchListener>,
        value_eq: bool,
    ) -> Destructor {
        match compiled.watch_delegate {
            Some(WatchDelegate::Constant) => self.watch_constant(compiled, listener, value_eq),
            Some(WatchDelegate::OneTime) => self.watch_one_time(compiled, listener, value_eq, false),
            Some(WatchDelegate::OneTimeLiteral) => self.watch_one_time(compiled, listener, value_eq, true),
            Some(WatchDelegate::Inputs) | None => {
                let watcher = Self::base_watcher(WatchSource::Expr(compiled), listener, value_eq);
                self.push_watcher(watcher)
            }
        }
    }

    pub fn watch_native(
        &self,
        watch_fn: Rc<dyn Fn(&Scope) -> Value>,
        listener: Option<WatchListener>,
        value_eq: bool,
    ) -> Destructor {
        let watcher = Self::base_watcher(WatchSource::Native(watch_fn), listener, value_eq);
        self.push_watcher(watcher)
    }

    /// Constant delegate: fires once, then self-removes.
    fn watch_constant(
        &self,
        compiled: Rc<crate::compiler::CompiledExpr>,
        listener: Option<WatchListener>,
        value_eq: bool,
    ) -> Destructor {
        let scope = self.clone();
        let destructor_cell: Rc<RefCell<Option<Destructor>>> = Rc::new(RefCell::new(None));
        let destructor_cell_for_listener = destructor_cell.clone();
        let wrapped_listener: WatchListener = Rc::new(move |new, old, s| {
            let result = match &listener {
                Some(l) => l(new, old, s),
                None => Ok(()),
            };
            if let Some(d) = destructor_cell_for_listener.borrow_mut().take() {
                d.run();
            }
            result
        });
        let watcher = Self::base_watcher(WatchSource::Expr(compiled), Some(wrapped_listener), value_eq);
        let real = scope.push_watcher(watcher);
        *destructor_cell.borrow_mut() = Some(real);
        Destructor(Box::new(move || {
            if let Some(d) = destructor_cell.borrow_mut().take() {
                d.run();
            }
        }))
    }

    /// One-time / one-time-literal delegate (spec §4.6).
    fn watch_one_time(
        &self,
        compiled: Rc<crate::compiler::CompiledExpr>,
        listener: Option<WatchListener>,
        value_eq: bool,
        literal: bool,
    ) -> Destructor {
        let scope = self.clone();
        let destructor_cell: Rc<RefCell<Option<Destructor>>> = Rc::new(RefCell::new(None));
        let destructor_for_listener = destructor_cell.clone();
        let scope_for_listener = scope.clone();
        let wrapped_listener: WatchListener = Rc::new(move |new, old, s| {
            let result = match &listener {
                Some(l) => l(new, old, s),
                None => Ok(()),
            };
            if is_defined(new, literal) {
                let destructor_for_post = destructor_for_listener.clone();
                let captured = new.clone();
                let literal = literal;
                scope_for_listener.post_digest(Rc::new(move |_scope| {
                    if is_defined(&captured, literal) {
                        if let Some(d) = destructor_for_post.borrow_mut().take() {
                            d.run();
                        }
                    }
                    Ok(Value::Undefined)
                }));
            }
            result
        });
        let watcher = Self::base_watcher(WatchSource::Expr(compiled), Some(wrapped_listener), value_eq);
        let real = scope.push_watcher(watcher);
        *destructor_cell.borrow_mut() = Some(real);
        Destructor(Box::new(move || {
            if let Some(d) = destructor_cell.borrow_mut().take() {
                d.run();
            }
        }))
    }

    /// `$watchGroup(exprs, listener)` (spec §4.9).
    pub fn watch_group(&self, exprs: &[&str], listener: WatchListener) -> Result<Destructor, EngineError> {
        if exprs.is_empty() {
            let fired = Rc::new(Cell::new(false));
            let fired_for_task = fired.clone();
            let listener_for_task = listener.clone();
            self.eval_async(Rc::new(move |s| {
                if !fired_for_task.get() {
                    fired_for_task.set(true);
                    let empty = Value::array(Vec::new());
                    listener_for_task(&empty, &empty, s)?;
                }
                Ok(Value::Undefined)
            }));
            return Ok(Destructor(Box::new(move || {
                fired.set(true);
            })));
        }

        let compiled: Vec<Rc<crate::compiler::CompiledExpr>> =
            exprs.iter().map(|e| self.compiler().compile(e)).collect::<Result<Vec<_>, _>>()?.into_iter().map(Rc::new).collect();

        let last_values: Rc<RefCell<Vec<Value>>> = Rc::new(RefCell::new(vec![Value::Undefined; compiled.len()]));
        // Only the array most recently dispatched to the group listener;
        // `None` until the first firing (spec §4.9: "first firing, both
        // argument arrays are the same sequence").
        let previously_fired: Rc<RefCell<Option<Value>>> = Rc::new(RefCell::new(None));
        let pending = Rc::new(Cell::new(false));
        let destructors: Rc<RefCell<Vec<Destructor>>> = Rc::new(RefCell::new(Vec::new()));

        for (i, expr) in compiled.iter().enumerate() {
            let last_values = last_values.clone();
            let previously_fired = previously_fired.clone();
            let pending = pending.clone();
            let listener = listener.clone();
            let idx = i;
            let per_input_listener: WatchListener = Rc::new(move |new_value, _old, scope| {
                last_values.borrow_mut()[idx] = new_value.clone();
                if pending.get() {
                    return Ok(());
                }
                pending.set(true);
                let last_values = last_values.clone();
                let previously_fired = previously_fired.clone();
                let pending = pending.clone();
                let listener = listener.clone();
                scope.eval_async(Rc::new(move |s| {
                    pending.set(false);
                    let new_values = Value::array(last_values.borrow().clone());
                    let old_values = previously_fired.borrow_mut().replace(new_values.clone()).unwrap_or_else(|| new_values.clone());
                    listener(&new_values, &old_values, s)?;
                    Ok(Value::Undefined)
                }));
                Ok(())
            });
            let d = self.watch_compiled(expr.clone(), Some(per_input_listener), false);
            destructors.borrow_mut().push(d);
        }

        Ok(Destructor(Box::new(move || {
            for d in destructors.borrow_mut().drain(..) {
                d.run();
            }
        })))
    }

    /// `$watchCollection(expr, listener)` (spec §4.8).
    pub fn watch_collection(&self, expr: &str, listener: WatchListener) -> Result<Destructor, EngineError> {
        let compiled = Rc::new(self.compiler().compile(expr)?);
        let tracking: Rc<RefCell<Option<Value>>> = Rc::new(RefCell::new(None));
        let change_count = Rc::new(Cell::new(0u64));
        let compiled_for_native = compiled.clone();
        let tracking_for_native = tracking.clone();
        let change_count_for_native = change_count.clone();

        let watch_fn: Rc<dyn Fn(&Scope) -> Value> = Rc::new(move |scope: &Scope| {
            let current = compiled_for_native.eval(scope, None).unwrap_or(Value::Undefined);
            let mut track = tracking_for_native.borrow_mut();
            let changed = match (&current, track.as_ref()) {
                (Value::Array(items), Some(Value::Array(prev))) => {
                    let items = items.borrow();
                    let prev = prev.borrow();
                    items.len() != prev.len()
                        || items.iter().zip(prev.iter()).any(|(a, b)| !a.reference_eq(b))
                }
                (Value::Object(items), Some(Value::Object(prev))) => {
                    let items = items.borrow();
                    let prev = prev.borrow();
                    items.len() != prev.len()
                        || items.iter().any(|(k, v)| !prev.get(k).is_some_and(|pv| v.reference_eq(pv)))
                }
                (a, Some(b)) => !a.reference_eq(b),
                (_, None) => true,
            };
            if changed {
                *track = Some(current.deep_clone());
                change_count_for_native.set(change_count_for_native.get() + 1);
            }
            Value::Number(change_count_for_native.get() as f64)
        });

        let tracking_for_listener = tracking.clone();
        let wrapped: WatchListener = Rc::new(move |_new, _old, scope| {
            let current = tracking_for_listener.borrow().clone().unwrap_or(Value::Undefined);
            listener(&current, &current, scope)
        });

        Ok(self.watch_native(watch_fn, Some(wrapped), false))
    }

    // ---- event bus (spec §4.10) ----

    pub fn on(&self, name: &str, listener: EventListener) -> Destructor {
        let mut listeners = self.0.listeners.borrow_mut();
        let slot = listeners.entry(name.to_string()).or_default();
        slot.push(Some(listener));
        let index = slot.len() - 1;
        drop(listeners);
        let scope = self.clone();
        let name = name.to_string();
        Destructor(Box::new(move || {
            if let Some(slot) = scope.0.listeners.borrow_mut().get_mut(&name) {
                if let Some(entry) = slot.get_mut(index) {
                    *entry = None;
                }
            }
        }))
    }

    fn fire(&self, event: &Event, args: &[Value]) {
        *event.current_scope.borrow_mut() = Some(self.clone());
        let snapshot: Vec<Option<EventListener>> = {
            let listeners = self.0.listeners.borrow();
            listeners.get(&event.name).cloned().unwrap_or_default()
        };
        let sink = self.sink();
        for listener in snapshot.into_iter().flatten() {
            if let Err(err) = listener(event, args) {
                sink.on_error(&err.to_string(), "event listener");
            }
        }
        self.compact_listeners(&event.name);
        *event.current_scope.borrow_mut() = None;
    }

    fn compact_listeners(&self, name: &str) {
        if let Some(slot) = self.0.listeners.borrow_mut().get_mut(name) {
            slot.retain(|l| l.is_some());
        }
    }

    /// `$emit(name, args)`: walks to the root, honouring `stopPropagation`.
    pub fn emit(&self, name: &str, args: Vec<Value>) -> Event {
        let event = Event {
            name: name.to_string(),
            target_scope: self.clone(),
            current_scope: RefCell::new(None),
            stop_propagation_flag: Cell::new(false),
            default_prevented: Cell::new(false),
            honours_stop_propagation: true,
        };
        let mut cursor = Some(self.clone());
        while let Some(scope) = cursor {
            scope.fire(&event, &args);
            if event.honours_stop_propagation && event.stop_propagation_flag.get() {
                break;
            }
            cursor = scope.0.parent.clone();
        }
        event
    }

    /// `$broadcast(name, args)`: pre-order walk of descendants, ignoring
    /// `stopPropagation`.
    pub fn broadcast(&self, name: &str, args: Vec<Value>) -> Event {
        let event = Event {
            name: name.to_string(),
            target_scope: self.clone(),
            current_scope: RefCell::new(None),
            stop_propagation_flag: Cell::new(false),
            default_prevented: Cell::new(false),
            honours_stop_propagation: false,
        };
        self.broadcast_walk(&event, &args);
        event
    }

    fn broadcast_walk(&self, event: &Event, args: &[Value]) {
        self.fire(event, args);
        let children: Vec<Scope> = self.0.children.borrow().clone();
        for child in children {
            child.broadcast_walk(event, args);
        }
    }
}

fn is_defined(value: &Value, literal: bool) -> bool {
    if !literal {
        return !value.is_undefined();
    }
    match value {
        Value::Undefined => false,
        Value::Array(items) => items.borrow().iter().all(|v| is_defined(v, true)),
        Value::Object(map) => map.borrow().iter().all(|(_, v)| is_defined(v, true)),
        _ => true,
    }
}
