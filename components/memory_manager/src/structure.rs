//! Structures: immutable object shape descriptors.
//!
//! Objects with the same properties added in the same order share a
//! structure, so an inline cache can identify an object's layout with one
//! pointer comparison and read a property at a fixed slot offset.
//!
//! Structures are reference counted and never mutated after creation. The
//! only interior state is the transition table, a cache from "add property
//! X" to the child structure, which is what makes same-path objects share.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use core_types::CellId;

/// Property names are interned-ish shared strings.
pub type PropertyName = Rc<str>;

/// Unique id of a structure, stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StructureId(pub u32);

/// Attributes of a property slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyAttributes {
    /// Whether ordinary assignment may change the value
    pub writable: bool,
    /// Whether the slot holds a getter/setter pair instead of a value
    pub accessor: bool,
}

impl PropertyAttributes {
    /// A plain writable data property.
    pub const DEFAULT: PropertyAttributes = PropertyAttributes {
        writable: true,
        accessor: false,
    };

    /// A non-writable data property.
    pub const READ_ONLY: PropertyAttributes = PropertyAttributes {
        writable: false,
        accessor: false,
    };

    /// An accessor property.
    pub const ACCESSOR: PropertyAttributes = PropertyAttributes {
        writable: true,
        accessor: true,
    };
}

impl Default for PropertyAttributes {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// How an object stores indexed elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexingType {
    /// No indexed storage; numeric keys are ordinary named properties
    None,
    /// Dense contiguous element vector (arrays)
    Contiguous,
}

/// A property descriptor in a structure.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyEntry {
    /// Name of the property
    pub name: PropertyName,
    /// Offset in the object's slot vector
    pub offset: u32,
    /// Slot attributes
    pub attributes: PropertyAttributes,
}

type TransitionKey = (PropertyName, PropertyAttributes);

/// Immutable shape descriptor shared by same-shaped objects.
pub struct Structure {
    id: StructureId,
    properties: Vec<PropertyEntry>,
    prototype: Option<CellId>,
    indexing: IndexingType,
    transitions: RefCell<HashMap<TransitionKey, Rc<Structure>>>,
}

impl Structure {
    /// Returns the structure id.
    pub fn id(&self) -> StructureId {
        self.id
    }

    /// Returns the prototype recorded in this shape.
    pub fn prototype(&self) -> Option<CellId> {
        self.prototype
    }

    /// Returns how objects of this shape store indexed elements.
    pub fn indexing(&self) -> IndexingType {
        self.indexing
    }

    /// Returns all properties in insertion order.
    pub fn properties(&self) -> &[PropertyEntry] {
        &self.properties
    }

    /// Returns the number of named slots objects of this shape carry.
    pub fn slot_count(&self) -> usize {
        self.properties.len()
    }

    /// Looks up a property by name.
    ///
    /// # Example
    ///
    /// ```
    /// use memory_manager::{PropertyAttributes, StructureRegistry};
    ///
    /// let mut registry = StructureRegistry::new();
    /// let empty = registry.empty_structure(None);
    /// let with_x = registry.add_property_transition(&empty, "x".into(), PropertyAttributes::DEFAULT);
    /// assert_eq!(with_x.lookup("x").map(|p| p.offset), Some(0));
    /// assert!(with_x.lookup("y").is_none());
    /// ```
    pub fn lookup(&self, name: &str) -> Option<&PropertyEntry> {
        self.properties.iter().find(|prop| &*prop.name == name)
    }

    /// Returns the number of cached outgoing transitions.
    pub fn transition_count(&self) -> usize {
        self.transitions.borrow().len()
    }
}

impl fmt::Debug for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.properties.iter().map(|p| &*p.name).collect();
        f.debug_struct("Structure")
            .field("id", &self.id.0)
            .field("properties", &names)
            .field("prototype", &self.prototype)
            .field("indexing", &self.indexing)
            .finish()
    }
}

/// Creates structures and hands out their ids.
///
/// Root structures are cached per (prototype, indexing type) so that
/// objects created the same way start from the same shape.
#[derive(Debug, Default)]
pub struct StructureRegistry {
    next_id: u32,
    roots: HashMap<(Option<CellId>, IndexingType), Rc<Structure>>,
}

impl StructureRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared empty structure for ordinary objects.
    pub fn empty_structure(&mut self, prototype: Option<CellId>) -> Rc<Structure> {
        self.root(prototype, IndexingType::None)
    }

    /// Returns the shared empty structure for arrays.
    pub fn array_structure(&mut self, prototype: Option<CellId>) -> Rc<Structure> {
        self.root(prototype, IndexingType::Contiguous)
    }

    fn root(&mut self, prototype: Option<CellId>, indexing: IndexingType) -> Rc<Structure> {
        if let Some(existing) = self.roots.get(&(prototype, indexing)) {
            return Rc::clone(existing);
        }
        let structure = self.create(Vec::new(), prototype, indexing);
        self.roots
            .insert((prototype, indexing), Rc::clone(&structure));
        structure
    }

    /// Returns the structure reached by adding `name` to `base`.
    ///
    /// Reuses the cached transition when one exists.
    pub fn add_property_transition(
        &mut self,
        base: &Rc<Structure>,
        name: PropertyName,
        attributes: PropertyAttributes,
    ) -> Rc<Structure> {
        let key = (Rc::clone(&name), attributes);
        if let Some(existing) = base.transitions.borrow().get(&key) {
            return Rc::clone(existing);
        }

        let mut properties = base.properties.clone();
        properties.push(PropertyEntry {
            name,
            offset: base.properties.len() as u32,
            attributes,
        });
        let child = self.create(properties, base.prototype, base.indexing);
        base.transitions.borrow_mut().insert(key, Rc::clone(&child));
        child
    }

    /// Returns an uncached copy of `base` with a different prototype.
    pub fn change_prototype(
        &mut self,
        base: &Structure,
        prototype: Option<CellId>,
    ) -> Rc<Structure> {
        self.create(base.properties.clone(), prototype, base.indexing)
    }

    /// Returns an uncached copy of `base` with new attributes for `name`.
    ///
    /// Returns `None` if `base` has no such property.
    pub fn change_attributes(
        &mut self,
        base: &Structure,
        name: &str,
        attributes: PropertyAttributes,
    ) -> Option<Rc<Structure>> {
        base.lookup(name)?;
        let properties = base
            .properties
            .iter()
            .map(|prop| {
                let mut prop = prop.clone();
                if &*prop.name == name {
                    prop.attributes = attributes;
                }
                prop
            })
            .collect();
        Some(self.create(properties, base.prototype, base.indexing))
    }

    fn create(
        &mut self,
        properties: Vec<PropertyEntry>,
        prototype: Option<CellId>,
        indexing: IndexingType,
    ) -> Rc<Structure> {
        let id = StructureId(self.next_id);
        self.next_id += 1;
        Rc::new(Structure {
            id,
            properties,
            prototype,
            indexing,
            transitions: RefCell::new(HashMap::new()),
        })
    }
}
