//! Base definitions for components.
//!
//! Components are plain data attached to entities. Each component type is
//! allocated a small, process-wide unique ID the first time it is used; the
//! ID is cached per type so later lookups are a single atomic load. There is a
//! macro (`component`) to generate the per-type cache.

use std::any::type_name;
use std::fmt::{self, Debug, Formatter};
use std::sync::RwLock;

use once_cell::sync::{Lazy, OnceCell};

use crate::mask::MAX_COMPONENT_TYPES;

/// A component type ID which is unique for a specific component type.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentTypeID(usize);

struct ComponentRegistration {
    name: &'static str,
}

struct ComponentRegistry {
    component_types: Vec<ComponentRegistration>,
}

static COMPONENT_REGISTRY: Lazy<RwLock<ComponentRegistry>> = Lazy::new(|| {
    RwLock::new(ComponentRegistry {
        component_types: Vec::new(),
    })
});

impl ComponentTypeID {
    /// Construct a new `ComponentTypeID` from the inner value.
    pub(crate) fn new(inner: usize) -> ComponentTypeID {
        ComponentTypeID(inner)
    }

    /// Fetch the cached ID of a component type.
    pub fn of<T: Component>() -> ComponentTypeID {
        T::component_type()
    }

    /// Allocate a new globally unique `ComponentTypeID`.
    ///
    /// This is normally called once per type through `AutoComponentTypeID`.
    ///
    /// # Panics
    /// If more than `MAX_COMPONENT_TYPES` types are registered.
    pub fn register<T: Component>() -> ComponentTypeID {
        let mut r = COMPONENT_REGISTRY.write().unwrap();
        let id = r.component_types.len();
        assert!(id < MAX_COMPONENT_TYPES,
                "too many component types registered (max {})", MAX_COMPONENT_TYPES);

        r.component_types.push(ComponentRegistration {
            name: type_name::<T>(),
        });
        log::trace!("registered component type #{} {}", id, type_name::<T>());
        ComponentTypeID(id)
    }

    /// Return the number of component types registered in this process.
    pub fn registered_count() -> usize {
        COMPONENT_REGISTRY.read().unwrap().component_types.len()
    }

    /// Return the inner unique ID.
    pub fn id(&self) -> usize {
        self.0
    }

    /// Return the type name this ID was registered for.
    pub fn name(&self) -> Option<&'static str> {
        let r = COMPONENT_REGISTRY.read().unwrap();
        r.component_types.get(self.0).map(|reg| reg.name)
    }
}

impl Debug for ComponentTypeID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "ComponentTypeID(#{} missing)", self.0),
        }
    }
}

/// A struct for lazily assigning unique `ComponentTypeID`s.
pub struct AutoComponentTypeID(OnceCell<ComponentTypeID>);

impl AutoComponentTypeID {
    /// Create a new `AutoComponentTypeID`.
    pub const fn new() -> AutoComponentTypeID {
        AutoComponentTypeID(OnceCell::new())
    }

    /// Get the `ComponentTypeID` this struct wraps, registering it on first
    /// use.
    pub fn get<T: Component>(&self) -> ComponentTypeID {
        *self.0.get_or_init(ComponentTypeID::register::<T>)
    }
}

impl Default for AutoComponentTypeID {
    fn default() -> Self {
        AutoComponentTypeID::new()
    }
}

/// The component trait is implemented on all component types.
///
/// Implementations must return the same ID on every call and no two types
/// may share an ID. Use the `component` macro rather than implementing this
/// by hand.
pub trait Component: Clone + Send + Sync + 'static {
    /// Get the unique type ID of this component.
    fn component_type() -> ComponentTypeID;
}

/// Implement the `Component` trait on a type.
///
/// Component types must implement `Clone`, `Send` and `Sync`.
#[macro_export]
macro_rules! component {
    ($i:ident) => {
        const _: () = {
            static INIT_TYPE: $crate::component::AutoComponentTypeID = $crate::component::AutoComponentTypeID::new();

            impl $crate::component::Component for $i {
                fn component_type() -> $crate::component::ComponentTypeID {
                    INIT_TYPE.get::<$i>()
                }
            }

            ()
        };
    };
}
