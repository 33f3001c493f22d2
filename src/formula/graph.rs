//! The formula-enabled object graph.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::Context as _;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::cache::UpdatedSymbolCache;
use super::definition::{Formula, FormulaId};
use super::manager::FormulaManager;
use super::symbols::SymbolMappings;
use crate::config::FormulaConfig;
use crate::error::{FormulaError, GraphError};
use crate::event::{Delivery, PathChangeEvent, PathListener};
use crate::graph::CachedObjectGraph;
use crate::path::{BeanPath, IntoPath};
use crate::tracer::{EvaluationResult, SpanId};
use crate::value::{BeanRef, ObjectId, Value};

#[cfg(feature = "background-drain")]
use super::scheduler::DrainScheduler;

/// A [`CachedObjectGraph`] that also serves formula pseudo-paths.
///
/// Registering a listener on `$formula.<name>` enables the named formula and
/// makes the graph listen to every path its symbols are bound to. Input
/// changes only mark `(root, symbol)` pairs dirty; a drain, run on a fixed
/// delay or through [`drain_now`](FormulaEnabledGraph::drain_now), recomputes
/// the affected formulas and publishes changed results as ordinary path
/// events.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use path_flow::{
///     CachedObjectGraph, FormulaConfig, FormulaEnabledGraph, FormulaManager, PathListener,
///     PropertyBag, Value,
/// };
///
/// struct Ignore;
/// impl PathListener for Ignore {}
///
/// let mut manager = FormulaManager::new();
/// manager.symbols_mut().add_named("p", "price").unwrap();
/// manager.create_formula("double", "p * 2");
///
/// let graph = FormulaEnabledGraph::new(CachedObjectGraph::new(), manager, FormulaConfig::manual()).unwrap();
/// let item = PropertyBag::new("Item");
/// item.declare("price", 21);
/// graph.add_root_object(&item.bean()).unwrap();
/// graph.add_path_listener("$formula.double", Arc::new(Ignore)).unwrap();
///
/// assert_eq!(graph.get(&item.bean(), "$formula.double").unwrap(), Value::NotReady);
/// graph.drain_now();
/// assert_eq!(graph.get(&item.bean(), "$formula.double").unwrap(), Value::from(42));
/// ```
pub struct FormulaEnabledGraph {
    core: Arc<FormulaCore>,
    #[cfg(feature = "background-drain")]
    scheduler: Mutex<Option<DrainScheduler>>,
}

/// Engine-side registrations made for one enabled formula.
struct Registration {
    /// One entry per symbol; the symbol listener is registered once per entry.
    paths: Vec<BeanPath>,
}

struct FormulaCore {
    base: CachedObjectGraph,
    config: FormulaConfig,
    manager: RwLock<FormulaManager>,
    results: Mutex<HashMap<(ObjectId, FormulaId), Value>>,
    dirty: UpdatedSymbolCache,
    registrations: Mutex<HashMap<FormulaId, Registration>>,
    symbol_listener: Arc<dyn PathListener>,
    disposed: AtomicBool,
    /// Serializes drains.
    draining: Mutex<()>,
}

/// Marks symbols dirty when their paths change.
struct SymbolListener {
    core: Weak<FormulaCore>,
}

impl PathListener for SymbolListener {
    fn multiple_change(&self, events: &[PathChangeEvent], _all_affect_same_roots: bool) {
        if let Some(core) = self.core.upgrade() {
            core.mark_dirty(events);
        }
    }

    fn delivery(&self) -> Delivery {
        Delivery::Batched
    }
}

fn symbol_paths(
    symbols: &SymbolMappings,
    formula: &Formula,
) -> Result<Vec<BeanPath>, GraphError> {
    if let Some(err) = formula.parse_error() {
        return Err(err.into());
    }
    formula
        .symbols()
        .iter()
        .map(|symbol| {
            let path = symbols
                .bean_path_for_symbol(symbol)
                .ok_or_else(|| FormulaError::UnboundSymbol(symbol.clone()))?;
            let path = BeanPath::parse(path)?;
            if path.is_formula() {
                return Err(FormulaError::FormulaDependency {
                    formula: formula.name().to_string(),
                    symbol: symbol.clone(),
                }
                .into());
            }
            Ok(path)
        })
        .collect()
}

impl FormulaCore {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn mark_dirty(&self, events: &[PathChangeEvent]) {
        if self.is_disposed() {
            return;
        }
        let manager = self.manager.read();
        for event in events {
            for mapping in manager.symbols().iter() {
                if BeanPath::parse(&mapping.path).ok().as_ref() != Some(event.path()) {
                    continue;
                }
                for root in event.roots() {
                    self.dirty.mark(&root.downgrade(), &mapping.symbol);
                }
            }
        }
    }

    /// Mark every symbol of `formula` dirty for each of `roots`.
    fn seed(&self, formula: &Formula, roots: &[BeanRef]) {
        for root in roots {
            for symbol in formula.symbols() {
                self.dirty.mark(&root.downgrade(), symbol);
            }
        }
    }

    /// Listen to `paths` on behalf of a formula, all or nothing.
    fn register_paths(&self, paths: &[BeanPath]) -> Result<(), GraphError> {
        for (index, path) in paths.iter().enumerate() {
            if let Err(err) = self
                .base
                .add_path_listener(path, self.symbol_listener.clone())
            {
                self.unregister_paths(&paths[..index]);
                return Err(err);
            }
        }
        Ok(())
    }

    fn unregister_paths(&self, paths: &[BeanPath]) {
        for path in paths {
            // Paths were parsed when registered; removal cannot fail.
            let _ = self.base.remove_path_listener(path, &self.symbol_listener);
        }
    }

    /// Drop every engine-side trace of a formula.
    fn retire(&self, id: FormulaId) {
        let registration = self.registrations.lock().remove(&id);
        if let Some(registration) = registration {
            self.unregister_paths(&registration.paths);
        }
        self.results.lock().retain(|(_, formula), _| *formula != id);
    }

    fn drain(&self) -> usize {
        let serial = self.draining.lock();
        if self.is_disposed() {
            return 0;
        }
        let span_id = self.base.tracer().new_span_id();
        let dirty = self.dirty.drain();
        self.base.tracer().on_drain(span_id, dirty.len());
        if dirty.is_empty() {
            return 0;
        }

        let (formulas, symbols) = {
            let manager = self.manager.read();
            let formulas: Vec<Formula> = manager
                .formulas()
                .iter()
                .filter(|f| f.is_enabled())
                .map(Formula::snapshot)
                .collect();
            (formulas, manager.symbols().clone())
        };

        let mut evaluations = 0;
        let mut events = Vec::new();
        for entry in &dirty {
            let Some(root) = entry.root.upgrade() else {
                continue;
            };
            if !self.base.contains_root(&root) {
                continue;
            }
            for formula in &formulas {
                if !formula.symbols().iter().any(|s| entry.contains(s)) {
                    continue;
                }
                evaluations += 1;
                events.extend(self.recompute(span_id, &root, formula, &symbols));
            }
        }
        debug!(
            span = span_id.0,
            roots = dirty.len(),
            evaluations,
            changed = events.len(),
            "drain finished"
        );
        // Listeners may start another drain.
        drop(serial);
        self.publish(events);
        evaluations
    }

    /// Evaluate `formula` for `root` and return an event if the cached result
    /// changed.
    fn recompute(
        &self,
        span_id: SpanId,
        root: &BeanRef,
        formula: &Formula,
        symbols: &SymbolMappings,
    ) -> Option<PathChangeEvent> {
        let tracer = self.base.tracer();
        let mut copy = formula.snapshot();
        let outcome = (|| -> anyhow::Result<Value> {
            for symbol in formula.symbols() {
                let path = symbols
                    .bean_path_for_symbol(symbol)
                    .with_context(|| format!("symbol '{symbol}' is not mapped"))?;
                let value = self
                    .base
                    .get(root, path)
                    .with_context(|| format!("reading '{path}' for symbol '{symbol}'"))?;
                if !value.is_ready() {
                    return Ok(Value::NotReady);
                }
                copy.bind(symbol, value);
            }
            Ok(copy.evaluate()?)
        })();

        let new = match outcome {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    formula = formula.name(),
                    root = ?root,
                    error = %format!("{err:#}"),
                    "formula evaluation failed"
                );
                tracer.on_formula_evaluated(
                    span_id,
                    formula.id(),
                    root.id(),
                    EvaluationResult::Error {
                        message: format!("{err:#}"),
                    },
                );
                return None;
            }
        };

        let key = (root.id(), formula.id());
        let old = {
            let mut results = self.results.lock();
            if self.is_disposed() {
                return None;
            }
            let old = results.get(&key).cloned().unwrap_or(Value::NotReady);
            if old != new {
                results.insert(key, new.clone());
            }
            old
        };

        let result = if !new.is_ready() {
            EvaluationResult::Deferred
        } else if old == new {
            EvaluationResult::Unchanged
        } else {
            EvaluationResult::Changed
        };
        tracer.on_formula_evaluated(span_id, formula.id(), root.id(), result);

        (old != new).then(|| PathChangeEvent::new(formula.path(), vec![root.clone()], old, new))
    }

    fn publish(&self, events: Vec<PathChangeEvent>) {
        if self.is_disposed() {
            return;
        }
        self.base.fire_synthetic(events);
    }
}

impl FormulaEnabledGraph {
    /// Wrap `base` with the formulas of `manager`.
    ///
    /// Starts the background drain when `config` has a drain interval and
    /// the `background-drain` feature is enabled.
    pub fn new(
        base: CachedObjectGraph,
        manager: FormulaManager,
        config: FormulaConfig,
    ) -> Result<Self, FormulaError> {
        let mut manager = manager;
        // Formulas are enabled by their listeners, not by the manager copy.
        for formula in manager.formulas().iter().map(Formula::id).collect::<Vec<_>>() {
            if let Some(formula) = manager.formula_mut(formula) {
                formula.set_enabled(false);
            }
        }

        let core = Arc::new_cyclic(|weak: &Weak<FormulaCore>| FormulaCore {
            base,
            config,
            manager: RwLock::new(manager),
            results: Mutex::new(HashMap::new()),
            dirty: UpdatedSymbolCache::new(),
            registrations: Mutex::new(HashMap::new()),
            symbol_listener: Arc::new(SymbolListener { core: weak.clone() }),
            disposed: AtomicBool::new(false),
            draining: Mutex::new(()),
        });

        #[cfg(feature = "background-drain")]
        let scheduler = match core.config.drain_interval() {
            Some(interval) if core.config.enabled => {
                let weak = Arc::downgrade(&core);
                let scheduler = DrainScheduler::start(interval, core.config.worker_threads, move || {
                    if let Some(core) = weak.upgrade() {
                        core.drain();
                    }
                })?;
                Some(scheduler)
            }
            _ => None,
        };
        #[cfg(not(feature = "background-drain"))]
        if core.config.drain_interval().is_some() {
            warn!("background draining needs the `background-drain` feature; call drain_now instead");
        }

        Ok(Self {
            core,
            #[cfg(feature = "background-drain")]
            scheduler: Mutex::new(scheduler),
        })
    }

    /// The underlying graph.
    pub fn base(&self) -> &CachedObjectGraph {
        &self.core.base
    }

    /// The configuration in effect.
    pub fn config(&self) -> &FormulaConfig {
        &self.core.config
    }

    /// Register a root on the underlying graph and schedule initial values
    /// for every enabled formula.
    pub fn add_root_object(&self, root: &BeanRef) -> Result<(), GraphError> {
        self.core.base.add_root_object(root)?;
        let manager = self.core.manager.read();
        for formula in manager.formulas().iter().filter(|f| f.is_enabled()) {
            self.core.seed(formula, std::slice::from_ref(root));
        }
        Ok(())
    }

    /// Release one registration of `root`; the last one also discards its
    /// formula results.
    pub fn remove_root_object(&self, root: &BeanRef) -> bool {
        let removed = self.core.base.remove_root_object(root);
        if removed {
            let id = root.id();
            self.core.results.lock().retain(|(object, _), _| *object != id);
            self.core.dirty.forget_root(id);
        }
        removed
    }

    /// Register `listener` for `path`.
    ///
    /// For a formula pseudo-path this also enables the formula and listens
    /// to the paths of its symbols. A formula that does not parse, or whose
    /// symbols are unmapped or bound to formulas, is rejected.
    pub fn add_path_listener(
        &self,
        path: impl IntoPath,
        listener: Arc<dyn PathListener>,
    ) -> Result<(), GraphError> {
        let path = path.into_path()?;
        if !path.is_formula() {
            return self.core.base.add_path_listener(path, listener);
        }
        let name = path.last();
        if self.core.is_disposed() {
            return Err(GraphError::Disposed);
        }
        if !self.core.config.enabled {
            return Err(GraphError::FormulasDisabled);
        }

        let (formula, paths) = {
            let manager = self.core.manager.read();
            let formula = manager
                .formula_by_name(name)
                .ok_or_else(|| GraphError::UnknownFormula(name.to_string()))?
                .snapshot();
            let paths = symbol_paths(manager.symbols(), &formula)?;
            (formula, paths)
        };

        let first = !self.core.registrations.lock().contains_key(&formula.id());
        if first {
            self.core.register_paths(&paths)?;
            self.core
                .registrations
                .lock()
                .insert(formula.id(), Registration { paths });
            if let Some(live) = self.core.manager.write().formula_mut(formula.id()) {
                live.set_enabled(true);
            }
            self.core.seed(&formula, &self.core.base.roots());
            debug!(formula = formula.name(), "formula enabled");
        }
        self.core.base.add_path_listener(path, listener)
    }

    /// Deregister one registration of `listener` for `path`.
    ///
    /// Removing the last listener of a formula pseudo-path disables the
    /// formula and stops listening to its inputs.
    pub fn remove_path_listener(
        &self,
        path: impl IntoPath,
        listener: &Arc<dyn PathListener>,
    ) -> Result<bool, GraphError> {
        let path = path.into_path()?;
        let removed = self.core.base.remove_path_listener(&path, listener)?;
        let Some(name) = path.formula_name() else {
            return Ok(removed);
        };
        if removed && self.core.base.listener_count(&path) == 0 {
            let id = self.core.manager.read().formula_by_name(name).map(Formula::id);
            if let Some(id) = id {
                self.core.retire(id);
                if let Some(live) = self.core.manager.write().formula_mut(id) {
                    live.set_enabled(false);
                }
                debug!(formula = name, "formula disabled");
            }
        }
        Ok(removed)
    }

    /// The value of `path` for `root`. Formula pseudo-paths answer with the
    /// last computed result, or `NotReady` before the first computation.
    pub fn get(&self, root: &BeanRef, path: impl IntoPath) -> Result<Value, GraphError> {
        let path = path.into_path()?;
        if !path.is_formula() {
            return self.core.base.get(root, path);
        }
        let name = path.last();
        let id = self
            .core
            .manager
            .read()
            .formula_by_name(name)
            .map(Formula::id)
            .ok_or_else(|| GraphError::UnknownFormula(name.to_string()))?;
        Ok(self
            .core
            .results
            .lock()
            .get(&(root.id(), id))
            .cloned()
            .unwrap_or(Value::NotReady))
    }

    /// Run one drain step on the calling thread. Returns the number of
    /// formula evaluations.
    pub fn drain_now(&self) -> usize {
        self.core.drain()
    }

    /// Number of dirty `(root, symbol)` pairs waiting for a drain.
    pub fn pending_count(&self) -> usize {
        self.core.dirty.len()
    }

    /// A deep copy of the live formula manager, for an editing session.
    pub fn formula_manager(&self) -> FormulaManager {
        let mut copy = FormulaManager::new();
        copy.initialise_from(&self.core.manager.read());
        copy
    }

    /// Replace the formula manager, typically with an edited copy from
    /// [`formula_manager`](FormulaEnabledGraph::formula_manager).
    ///
    /// Removed or disabled formulas lose their listeners; renamed formulas
    /// keep theirs under the new pseudo-path. Enabled formulas whose
    /// expression and inputs are unchanged keep their results; every other
    /// enabled formula is recomputed for every root before this returns.
    pub fn set_formula_manager(&self, manager: FormulaManager) -> Result<(), GraphError> {
        if self.core.is_disposed() {
            return Err(GraphError::Disposed);
        }
        let old = self.formula_manager();
        let registered: Vec<FormulaId> = self.core.registrations.lock().keys().copied().collect();

        // Resolve every surviving registration first so a bad manager
        // changes nothing.
        let mut moves = Vec::new();
        for &id in &registered {
            let (Some(before), Some(after)) = (old.formula(id), manager.formula(id)) else {
                continue;
            };
            if !after.is_enabled() {
                continue;
            }
            let paths = symbol_paths(manager.symbols(), after)?;
            moves.push((before.clone(), after.clone(), paths));
        }

        // Listen to changed inputs before touching anything else; undo on
        // failure.
        let mut rewired: Vec<(FormulaId, Vec<BeanPath>, Vec<BeanPath>)> = Vec::new();
        for (_, after, paths) in &moves {
            let old_paths = self
                .core
                .registrations
                .lock()
                .get(&after.id())
                .map(|r| r.paths.clone())
                .unwrap_or_default();
            if old_paths == *paths {
                continue;
            }
            if let Err(err) = self.core.register_paths(paths) {
                for (_, _, added) in &rewired {
                    self.core.unregister_paths(added);
                }
                return Err(err);
            }
            rewired.push((after.id(), old_paths, paths.clone()));
        }

        for &id in &registered {
            let survives = manager.formula(id).is_some_and(Formula::is_enabled);
            if !survives {
                if let Some(before) = old.formula(id) {
                    let listeners = self.core.base.take_path_listeners(&before.path());
                    debug!(formula = before.name(), listeners = listeners.len(), "formula removed");
                }
                self.core.retire(id);
            }
        }

        let rewired_ids: Vec<FormulaId> = rewired.iter().map(|(id, _, _)| *id).collect();
        for (id, old_paths, paths) in rewired {
            self.core.unregister_paths(&old_paths);
            self.core
                .registrations
                .lock()
                .insert(id, Registration { paths });
        }

        // Take every renamed formula's listeners before placing any, so
        // formulas that trade names keep their own.
        let renamed: Vec<(BeanPath, Vec<Arc<dyn PathListener>>)> = moves
            .iter()
            .filter(|(before, after, _)| before.name() != after.name())
            .map(|(before, after, _)| {
                debug!(from = before.name(), to = after.name(), "formula renamed");
                (after.path(), self.core.base.take_path_listeners(&before.path()))
            })
            .collect();
        for (path, listeners) in renamed {
            self.core.base.put_path_listeners(path, listeners);
        }

        let recompute: Vec<FormulaId> = moves
            .iter()
            .filter(|(before, after, _)| {
                rewired_ids.contains(&after.id()) || before.expression() != after.expression()
            })
            .map(|(_, after, _)| after.id())
            .collect();

        let mut installed = manager;
        let registered: Vec<FormulaId> = self.core.registrations.lock().keys().copied().collect();
        for formula in installed.formulas().iter().map(Formula::id).collect::<Vec<_>>() {
            let enabled = registered.contains(&formula);
            if let Some(formula) = installed.formula_mut(formula) {
                formula.set_enabled(enabled);
            }
        }
        let (formulas, symbols) = {
            let mut live = self.core.manager.write();
            *live = installed;
            let formulas: Vec<Formula> = recompute
                .iter()
                .filter_map(|id| live.formula(*id).map(Formula::snapshot))
                .collect();
            (formulas, live.symbols().clone())
        };

        let span_id = self.core.base.tracer().new_span_id();
        let mut events = Vec::new();
        for root in self.core.base.roots() {
            for formula in &formulas {
                events.extend(self.core.recompute(span_id, &root, formula, &symbols));
            }
        }
        self.core.publish(events);
        Ok(())
    }

    /// Stop draining and detach from the underlying graph.
    ///
    /// Later drains do nothing; a drain already running finishes without
    /// publishing. Listeners on formula pseudo-paths stay registered on the
    /// base graph until removed.
    pub fn dispose(&self) {
        if self.core.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        #[cfg(feature = "background-drain")]
        if let Some(mut scheduler) = self.scheduler.lock().take() {
            scheduler.stop();
        }
        let ids: Vec<FormulaId> = self.core.registrations.lock().keys().copied().collect();
        for id in ids {
            self.core.retire(id);
        }
        self.core.dirty.drain();
        debug!("formula graph disposed");
    }

    /// Returns true once [`dispose`](FormulaEnabledGraph::dispose) has run.
    pub fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }
}

impl Drop for FormulaEnabledGraph {
    fn drop(&mut self) {
        self.dispose();
    }
}
