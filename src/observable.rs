//! The observable capability business objects expose, and a ready-made
//! dynamic implementation of it.
//!
//! The graph never owns business objects. It reads properties through
//! [`Observable::property`] and registers one [`PropertyListener`] per
//! `(object, property)` pair it needs to watch.

use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::GraphError;
use crate::value::{BeanRef, ObjectId, Value};

/// How a property read may behave when the value is not loaded yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// The object may load the value before returning.
    #[default]
    Blocking,
    /// The object must answer [`Value::NotReady`] and deliver the value later
    /// through a property change.
    NonBlocking,
}

/// A single property change reported by an [`Observable`].
#[derive(Debug, Clone, Copy)]
pub struct PropertyChange<'a> {
    /// Identity of the object whose property changed.
    pub source: ObjectId,
    /// Name of the changed property.
    pub property: &'a str,
    /// Previous value.
    pub old: &'a Value,
    /// New value.
    pub new: &'a Value,
}

/// Receives property changes.
pub trait PropertyListener: Send + Sync + 'static {
    /// Called after a property has changed.
    fn property_changed(&self, change: PropertyChange<'_>);
}

/// An object whose named properties can be read and observed.
///
/// Implementations must not hold internal locks while notifying listeners:
/// a listener may read properties of the same object from inside the
/// callback.
pub trait Observable: Send + Sync + 'static {
    /// Type name used in diagnostics.
    fn bean_type(&self) -> &str;

    /// Read a property.
    ///
    /// Returns [`GraphError::UnknownProperty`] if the object has no such
    /// property.
    fn property(&self, name: &str, mode: ReadMode) -> Result<Value, GraphError>;

    /// Register `listener` for changes to the named property.
    fn add_property_listener(&self, name: &str, listener: Arc<dyn PropertyListener>);

    /// Deregister a listener previously passed to `add_property_listener`.
    fn remove_property_listener(&self, name: &str, listener: &Arc<dyn PropertyListener>);
}

pub(crate) fn same_listener<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Listener bookkeeping for [`Observable`] implementations.
///
/// Registrations are kept per property name; the same listener may be
/// registered more than once and is then notified once per registration.
#[derive(Default)]
pub struct PropertyChangeSupport {
    listeners: Mutex<Vec<(Arc<str>, Arc<dyn PropertyListener>)>>,
}

impl PropertyChangeSupport {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one property.
    pub fn add(&self, property: &str, listener: Arc<dyn PropertyListener>) {
        self.listeners.lock().push((Arc::from(property), listener));
    }

    /// Remove one registration of `listener` for `property`.
    pub fn remove(&self, property: &str, listener: &Arc<dyn PropertyListener>) -> bool {
        let mut listeners = self.listeners.lock();
        match listeners
            .iter()
            .position(|(p, l)| &**p == property && same_listener(l, listener))
        {
            Some(index) => {
                listeners.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of registrations for `property`.
    pub fn listener_count(&self, property: &str) -> usize {
        self.listeners
            .lock()
            .iter()
            .filter(|(p, _)| &**p == property)
            .count()
    }

    /// Total number of registrations.
    pub fn total_listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Notify every listener of `property`.
    ///
    /// The registry lock is released before any listener runs.
    pub fn fire(&self, source: ObjectId, property: &str, old: &Value, new: &Value) {
        let targets: Vec<Arc<dyn PropertyListener>> = self
            .listeners
            .lock()
            .iter()
            .filter(|(p, _)| &**p == property)
            .map(|(_, l)| l.clone())
            .collect();
        let change = PropertyChange {
            source,
            property,
            old,
            new,
        };
        for listener in targets {
            listener.property_changed(change);
        }
    }
}

/// The external "load" capability behind lazily loaded properties.
pub trait PropertyLoader: Send + Sync + 'static {
    /// Load a value synchronously, on the calling thread.
    fn load(&self, bean_type: &str, property: &str) -> Value;

    /// Start an asynchronous load. The loader completes the request later,
    /// from any thread, with [`LoadRequest::complete`].
    fn request(&self, request: LoadRequest);
}

/// A pending asynchronous load of one [`PropertyBag`] property.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    bag: Weak<PropertyBag>,
    bean_type: String,
    property: String,
}

impl LoadRequest {
    /// Type name of the requesting object.
    pub fn bean_type(&self) -> &str {
        &self.bean_type
    }

    /// The requested property.
    pub fn property(&self) -> &str {
        &self.property
    }

    /// Deliver the loaded value. Fires a change from `NotReady` to `value`.
    ///
    /// Does nothing if the object has been dropped or the property was
    /// assigned in the meantime.
    pub fn complete(&self, value: impl Into<Value>) {
        if let Some(bag) = self.bag.upgrade() {
            bag.finish_load(&self.property, value.into());
        }
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Ready(Value),
    Unloaded,
    Loading,
}

/// A dynamic business object: a typed bag of named, observable properties.
///
/// Properties must be declared before they can be read or assigned; reading
/// an undeclared property is a [`GraphError::UnknownProperty`]. Lazy
/// properties are loaded through a [`PropertyLoader`] on first read.
///
/// # Example
///
/// ```
/// # use path_flow::{PropertyBag, Observable, ReadMode, Value};
/// let person = PropertyBag::new("Person");
/// person.declare("name", "Ann");
/// assert_eq!(person.property("name", ReadMode::Blocking).unwrap(), Value::from("Ann"));
/// person.set("name", "Bob").unwrap();
/// assert_eq!(person.get("name").unwrap(), Value::from("Bob"));
/// assert!(person.set("age", 3).is_err());
/// ```
pub struct PropertyBag {
    bean_type: String,
    slots: Mutex<IndexMap<String, Slot>>,
    support: PropertyChangeSupport,
    loader: Option<Arc<dyn PropertyLoader>>,
    this: Weak<PropertyBag>,
}

impl PropertyBag {
    /// Create an empty bag.
    pub fn new(bean_type: impl Into<String>) -> Arc<Self> {
        Self::build(bean_type.into(), None)
    }

    /// Create an empty bag whose lazy properties are served by `loader`.
    pub fn with_loader(bean_type: impl Into<String>, loader: Arc<dyn PropertyLoader>) -> Arc<Self> {
        Self::build(bean_type.into(), Some(loader))
    }

    fn build(bean_type: String, loader: Option<Arc<dyn PropertyLoader>>) -> Arc<Self> {
        Arc::new_cyclic(|this| PropertyBag {
            bean_type,
            slots: Mutex::new(IndexMap::new()),
            support: PropertyChangeSupport::new(),
            loader,
            this: this.clone(),
        })
    }

    /// A shared handle to this bag.
    pub fn bean(self: &Arc<Self>) -> BeanRef {
        BeanRef::from(self.clone())
    }

    /// Declare (or silently overwrite) a property, without notifying anyone.
    pub fn declare(&self, name: &str, value: impl Into<Value>) {
        self.slots
            .lock()
            .insert(name.to_string(), Slot::Ready(value.into()));
    }

    /// Declare a property whose value comes from the loader on first read.
    pub fn declare_lazy(&self, name: &str) {
        self.slots.lock().insert(name.to_string(), Slot::Unloaded);
    }

    /// Assign a declared property and notify listeners if the value changed.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<(), GraphError> {
        let new = value.into();
        let old = {
            let mut slots = self.slots.lock();
            let slot = slots.get_mut(name).ok_or_else(|| self.unknown(name))?;
            let old = match slot {
                Slot::Ready(old) => old.clone(),
                Slot::Unloaded | Slot::Loading => Value::NotReady,
            };
            *slot = Slot::Ready(new.clone());
            old
        };
        if old != new {
            self.support.fire(ObjectId::of(self), name, &old, &new);
        }
        Ok(())
    }

    /// Current value of a declared property, without triggering a load.
    pub fn get(&self, name: &str) -> Result<Value, GraphError> {
        match self.slots.lock().get(name) {
            Some(Slot::Ready(value)) => Ok(value.clone()),
            Some(Slot::Unloaded | Slot::Loading) => Ok(Value::NotReady),
            None => Err(self.unknown(name)),
        }
    }

    /// Number of listeners registered for `name`.
    pub fn listener_count(&self, name: &str) -> usize {
        self.support.listener_count(name)
    }

    /// Number of listeners registered across all properties.
    pub fn total_listener_count(&self) -> usize {
        self.support.total_listener_count()
    }

    fn unknown(&self, name: &str) -> GraphError {
        GraphError::UnknownProperty {
            bean_type: self.bean_type.clone(),
            property: name.to_string(),
        }
    }

    fn finish_load(&self, name: &str, value: Value) {
        {
            let mut slots = self.slots.lock();
            match slots.get_mut(name) {
                Some(slot) if matches!(slot, Slot::Loading | Slot::Unloaded) => {
                    *slot = Slot::Ready(value.clone())
                }
                _ => return,
            }
        }
        self.support
            .fire(ObjectId::of(self), name, &Value::NotReady, &value);
    }
}

impl Observable for PropertyBag {
    fn bean_type(&self) -> &str {
        &self.bean_type
    }

    fn property(&self, name: &str, mode: ReadMode) -> Result<Value, GraphError> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(name).ok_or_else(|| self.unknown(name))?;
        match slot {
            Slot::Ready(value) => Ok(value.clone()),
            Slot::Loading => Ok(Value::NotReady),
            Slot::Unloaded => {
                let Some(loader) = self.loader.clone() else {
                    return Ok(Value::NotReady);
                };
                match mode {
                    ReadMode::Blocking => {
                        drop(slots);
                        let value = loader.load(&self.bean_type, name);
                        let mut slots = self.slots.lock();
                        match slots.get_mut(name) {
                            Some(slot) if matches!(slot, Slot::Unloaded) => {
                                *slot = Slot::Ready(value.clone());
                                Ok(value)
                            }
                            Some(Slot::Ready(current)) => Ok(current.clone()),
                            _ => Ok(value),
                        }
                    }
                    ReadMode::NonBlocking => {
                        *slot = Slot::Loading;
                        drop(slots);
                        tracing::trace!(bean_type = %self.bean_type, property = name, "requesting load");
                        loader.request(LoadRequest {
                            bag: self.this.clone(),
                            bean_type: self.bean_type.clone(),
                            property: name.to_string(),
                        });
                        Ok(Value::NotReady)
                    }
                }
            }
        }
    }

    fn add_property_listener(&self, name: &str, listener: Arc<dyn PropertyListener>) {
        self.support.add(name, listener);
    }

    fn remove_property_listener(&self, name: &str, listener: &Arc<dyn PropertyListener>) {
        self.support.remove(name, listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl PropertyListener for Counter {
        fn property_changed(&self, _change: PropertyChange<'_>) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[derive(Default)]
    struct QueueLoader {
        requests: Mutex<Vec<LoadRequest>>,
    }

    impl PropertyLoader for QueueLoader {
        fn load(&self, _bean_type: &str, property: &str) -> Value {
            Value::from(format!("loaded {property}"))
        }

        fn request(&self, request: LoadRequest) {
            self.requests.lock().push(request);
        }
    }

    #[test]
    fn test_set_fires_only_on_change() {
        let bag = PropertyBag::new("Item");
        bag.declare("count", 1);
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        bag.add_property_listener("count", counter.clone());

        bag.set("count", 1).unwrap();
        assert_eq!(counter.0.load(Ordering::Relaxed), 0);
        bag.set("count", 2).unwrap();
        assert_eq!(counter.0.load(Ordering::Relaxed), 1);

        let as_dyn: Arc<dyn PropertyListener> = counter.clone();
        bag.remove_property_listener("count", &as_dyn);
        bag.set("count", 3).unwrap();
        assert_eq!(counter.0.load(Ordering::Relaxed), 1);
        assert_eq!(bag.total_listener_count(), 0);
    }

    #[test]
    fn test_unknown_property() {
        let bag = PropertyBag::new("Item");
        let err = bag.property("missing", ReadMode::Blocking).unwrap_err();
        assert!(matches!(err, GraphError::UnknownProperty { ref property, .. } if property == "missing"));
    }

    #[test]
    fn test_lazy_blocking_load() {
        let loader = Arc::new(QueueLoader::default());
        let bag = PropertyBag::with_loader("Item", loader.clone());
        bag.declare_lazy("details");
        assert_eq!(bag.get("details").unwrap(), Value::NotReady);
        assert_eq!(
            bag.property("details", ReadMode::Blocking).unwrap(),
            Value::from("loaded details")
        );
        assert!(loader.requests.lock().is_empty());
    }

    #[test]
    fn test_lazy_non_blocking_load() {
        let loader = Arc::new(QueueLoader::default());
        let bag = PropertyBag::with_loader("Item", loader.clone());
        bag.declare_lazy("details");
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        bag.add_property_listener("details", counter.clone());

        assert_eq!(bag.property("details", ReadMode::NonBlocking).unwrap(), Value::NotReady);
        // A second read while loading does not issue another request.
        assert_eq!(bag.property("details", ReadMode::NonBlocking).unwrap(), Value::NotReady);
        let request = {
            let mut requests = loader.requests.lock();
            assert_eq!(requests.len(), 1);
            requests.pop().unwrap()
        };
        assert_eq!(request.property(), "details");

        request.complete("ready");
        assert_eq!(counter.0.load(Ordering::Relaxed), 1);
        assert_eq!(bag.get("details").unwrap(), Value::from("ready"));
    }
}
