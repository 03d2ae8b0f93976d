//! Object representation and the cell heap.
//!
//! Every object points at its [`Structure`] and stores named property
//! values in a slot vector indexed by structure offsets. Arrays also carry
//! a dense element vector. Cells are never moved or collected here; the
//! heap is an arena indexed by [`CellId`].

use std::rc::Rc;

use core_types::{CellId, FunctionId, HostFunctionId, Value};

use crate::structure::{
    IndexingType, PropertyAttributes, PropertyEntry, PropertyName, Structure, StructureRegistry,
};

/// What kind of object a cell is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// Plain object
    Ordinary,
    /// Array with contiguous elements
    Array,
    /// Script function backed by a function executable
    Function(FunctionId),
    /// Native host function
    HostFunction(HostFunctionId),
}

/// Object with structure-based property storage.
#[derive(Debug)]
pub struct JsObject {
    structure: Rc<Structure>,
    slots: Vec<Value>,
    elements: Vec<Value>,
    kind: ObjectKind,
}

impl JsObject {
    /// Returns the object's current structure.
    pub fn structure(&self) -> &Rc<Structure> {
        &self.structure
    }

    /// Returns the object kind.
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Reads the named slot at `offset`.
    pub fn slot(&self, offset: u32) -> Option<Value> {
        self.slots.get(offset as usize).copied()
    }

    /// Returns the indexed elements (empty for non-arrays).
    pub fn elements(&self) -> &[Value] {
        &self.elements
    }

    /// Returns true if the object stores contiguous elements.
    pub fn has_indexed_storage(&self) -> bool {
        self.structure.indexing() == IndexingType::Contiguous
    }
}

/// A getter/setter pair stored in an accessor property slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GetterSetter {
    /// Function called on read, or undefined
    pub getter: Value,
    /// Function called on write, or undefined
    pub setter: Value,
}

/// A heap cell.
#[derive(Debug)]
pub enum HeapCell {
    /// Any object, including arrays and functions
    Object(JsObject),
    /// Immutable string
    String(Rc<str>),
    /// Accessor pair referenced from an accessor slot
    GetterSetter(GetterSetter),
}

/// Result of a property lookup along the prototype chain.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertySlot {
    /// Object that actually holds the property
    pub holder: CellId,
    /// The property's descriptor in the holder's structure
    pub entry: PropertyEntry,
    /// The value stored in the slot (an accessor pair cell for accessors)
    pub value: Value,
    /// Number of prototype hops from the base object to the holder
    pub depth: u32,
}

/// Arena of heap cells plus the structure registry.
///
/// # Example
///
/// ```
/// use memory_manager::{ObjectHeap, PropertyAttributes};
/// use core_types::Value;
///
/// let mut heap = ObjectHeap::new();
/// let obj = heap.allocate_object(None);
/// heap.put_direct(obj, "x".into(), Value::Smi(1), PropertyAttributes::DEFAULT);
/// let slot = heap.lookup_property(obj, "x").unwrap();
/// assert_eq!(slot.value, Value::Smi(1));
/// ```
#[derive(Debug, Default)]
pub struct ObjectHeap {
    cells: Vec<HeapCell>,
    structures: StructureRegistry,
}

/// Prototype chains longer than this are treated as cyclic.
const MAX_PROTOTYPE_DEPTH: u32 = 1024;

impl ObjectHeap {
    /// Creates an empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of allocated cells.
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Returns the structure registry.
    pub fn structures(&mut self) -> &mut StructureRegistry {
        &mut self.structures
    }

    fn push(&mut self, cell: HeapCell) -> CellId {
        let id = CellId(self.cells.len() as u32);
        self.cells.push(cell);
        id
    }

    fn push_object(&mut self, structure: Rc<Structure>, kind: ObjectKind) -> CellId {
        self.push(HeapCell::Object(JsObject {
            structure,
            slots: Vec::new(),
            elements: Vec::new(),
            kind,
        }))
    }

    /// Allocates an ordinary empty object.
    pub fn allocate_object(&mut self, prototype: Option<CellId>) -> CellId {
        let structure = self.structures.empty_structure(prototype);
        self.push_object(structure, ObjectKind::Ordinary)
    }

    /// Allocates an array holding `elements`.
    pub fn allocate_array(&mut self, prototype: Option<CellId>, elements: Vec<Value>) -> CellId {
        let structure = self.structures.array_structure(prototype);
        let id = self.push_object(structure, ObjectKind::Array);
        if let Some(object) = self.object_mut(id) {
            object.elements = elements;
        }
        id
    }

    /// Allocates a function object for a script function.
    pub fn allocate_function(&mut self, function: FunctionId, prototype: Option<CellId>) -> CellId {
        let structure = self.structures.empty_structure(prototype);
        self.push_object(structure, ObjectKind::Function(function))
    }

    /// Allocates a function object for a host function.
    pub fn allocate_host_function(
        &mut self,
        function: HostFunctionId,
        prototype: Option<CellId>,
    ) -> CellId {
        let structure = self.structures.empty_structure(prototype);
        self.push_object(structure, ObjectKind::HostFunction(function))
    }

    /// Allocates a string cell.
    pub fn allocate_string(&mut self, contents: &str) -> CellId {
        self.push(HeapCell::String(contents.into()))
    }

    /// Allocates an accessor pair cell.
    pub fn allocate_getter_setter(&mut self, getter: Value, setter: Value) -> CellId {
        self.push(HeapCell::GetterSetter(GetterSetter { getter, setter }))
    }

    /// Returns the cell with the given id.
    pub fn cell(&self, id: CellId) -> Option<&HeapCell> {
        self.cells.get(id.index())
    }

    /// Returns the object stored in a cell.
    pub fn object(&self, id: CellId) -> Option<&JsObject> {
        match self.cells.get(id.index()) {
            Some(HeapCell::Object(object)) => Some(object),
            _ => None,
        }
    }

    fn object_mut(&mut self, id: CellId) -> Option<&mut JsObject> {
        match self.cells.get_mut(id.index()) {
            Some(HeapCell::Object(object)) => Some(object),
            _ => None,
        }
    }

    /// Returns the contents of a string cell.
    pub fn string(&self, id: CellId) -> Option<&Rc<str>> {
        match self.cells.get(id.index()) {
            Some(HeapCell::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Returns the accessor pair stored in a cell.
    pub fn getter_setter(&self, id: CellId) -> Option<GetterSetter> {
        match self.cells.get(id.index()) {
            Some(HeapCell::GetterSetter(pair)) => Some(*pair),
            _ => None,
        }
    }

    /// Returns the structure of an object cell.
    pub fn structure_of(&self, id: CellId) -> Option<Rc<Structure>> {
        self.object(id).map(|object| Rc::clone(&object.structure))
    }

    /// Finds `name` on the object or its prototype chain.
    pub fn lookup_property(&self, base: CellId, name: &str) -> Option<PropertySlot> {
        let mut current = Some(base);
        let mut depth = 0;
        while let Some(id) = current {
            let object = self.object(id)?;
            if let Some(entry) = object.structure.lookup(name) {
                return Some(PropertySlot {
                    holder: id,
                    value: object.slot(entry.offset).unwrap_or_default(),
                    entry: entry.clone(),
                    depth,
                });
            }
            depth += 1;
            if depth > MAX_PROTOTYPE_DEPTH {
                return None;
            }
            current = object.structure.prototype();
        }
        None
    }

    /// Reads a named slot by offset.
    pub fn read_slot(&self, id: CellId, offset: u32) -> Option<Value> {
        self.object(id)?.slot(offset)
    }

    /// Writes a named slot by offset. Returns false if the slot is missing.
    pub fn write_slot(&mut self, id: CellId, offset: u32, value: Value) -> bool {
        match self
            .object_mut(id)
            .and_then(|object| object.slots.get_mut(offset as usize))
        {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Defines or overwrites an own property, bypassing setters, the
    /// prototype chain and writability.
    ///
    /// Returns the offset of the slot written.
    pub fn put_direct(
        &mut self,
        id: CellId,
        name: PropertyName,
        value: Value,
        attributes: PropertyAttributes,
    ) -> Option<u32> {
        let structure = self.structure_of(id)?;
        if let Some(entry) = structure.lookup(&name) {
            let offset = entry.offset;
            if entry.attributes != attributes {
                let changed = self
                    .structures
                    .change_attributes(&structure, &name, attributes)?;
                self.object_mut(id)?.structure = changed;
            }
            self.write_slot(id, offset, value);
            return Some(offset);
        }

        let next = self
            .structures
            .add_property_transition(&structure, name, attributes);
        self.transition_and_append(id, next, value)
    }

    /// Moves an object to `next`, which must extend its current structure by
    /// exactly one slot, and stores `value` in the new slot.
    pub fn transition_and_append(
        &mut self,
        id: CellId,
        next: Rc<Structure>,
        value: Value,
    ) -> Option<u32> {
        let object = self.object_mut(id)?;
        if next.slot_count() != object.slots.len() + 1 {
            return None;
        }
        let offset = object.slots.len() as u32;
        object.slots.push(value);
        object.structure = next;
        Some(offset)
    }

    /// Gives an object a new prototype, moving it to a fresh structure.
    pub fn set_prototype(&mut self, id: CellId, prototype: Option<CellId>) -> bool {
        let Some(structure) = self.structure_of(id) else {
            return false;
        };
        let changed = self.structures.change_prototype(&structure, prototype);
        match self.object_mut(id) {
            Some(object) => {
                object.structure = changed;
                true
            }
            None => false,
        }
    }

    /// Reads an element. `None` if the index is out of bounds or the object
    /// has no indexed storage.
    pub fn element(&self, id: CellId, index: u32) -> Option<Value> {
        self.object(id)?.elements.get(index as usize).copied()
    }

    /// Returns the element count of an object.
    pub fn element_count(&self, id: CellId) -> Option<usize> {
        self.object(id).map(|object| object.elements.len())
    }

    /// Writes an element, growing the vector (padding with undefined) when
    /// `index` is at or past the end. Returns false for objects without
    /// indexed storage.
    pub fn put_element(&mut self, id: CellId, index: u32, value: Value) -> bool {
        let Some(object) = self.object_mut(id) else {
            return false;
        };
        if !object.has_indexed_storage() {
            return false;
        }
        let index = index as usize;
        if index >= object.elements.len() {
            object.elements.resize(index + 1, Value::Undefined);
        }
        object.elements[index] = value;
        true
    }
}
