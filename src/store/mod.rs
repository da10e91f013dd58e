// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The runtime store and module instantiation.
//!
//! A [`Store`] owns every runtime instance allocated from decoded modules.
//! Instances are referred to by kind-typed addresses: indices into the
//! store's per-kind vectors, which only ever grow, so an address stays
//! valid (and keeps meaning the same thing) for the store's lifetime.
//!
//! [`Store::allocate`] is the linking step: given a decoded [`Module`] and
//! the host's external values for its imports, it allocates this module's
//! functions, tables, memories, and globals, assembles a
//! [`ModuleInstance`] mapping the module's index spaces to addresses, and
//! resolves its exports. Running element/data segments and computing global
//! initial values against the allocated objects is the execution engine's
//! job, not the allocator's; tables come up empty and memories zeroed.

use crate::Allocator;
use crate::compat::vec::Vec;
use crate::types::{
    ExportDesc, Function, FunctionType, GlobalType, MemoryType, Module, Name, TableType,
    index_space,
};

index_space!(
    /// The address of a [`FunctionInstance`] in a store.
    FuncAddr,
    /// The address of a [`TableInstance`] in a store.
    TableAddr,
    /// The address of a [`MemoryInstance`] in a store.
    MemAddr,
    /// The address of a [`GlobalInstance`] in a store.
    GlobalAddr,
    /// The address of a [`ModuleInstance`] in a store.
    ModuleAddr,
);

/// The kind of a runtime object, for diagnostics.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExternalKind {
    Function,
    Table,
    Memory,
    Global,
}

/// A kind-typed address, as supplied by a host to satisfy an import or
/// produced by resolving an export.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExternalValue {
    Function(FuncAddr),
    Table(TableAddr),
    Memory(MemAddr),
    Global(GlobalAddr),
}

impl ExternalValue {
    pub fn kind(self) -> ExternalKind {
        match self {
            ExternalValue::Function(_) => ExternalKind::Function,
            ExternalValue::Table(_) => ExternalKind::Table,
            ExternalValue::Memory(_) => ExternalKind::Memory,
            ExternalValue::Global(_) => ExternalKind::Global,
        }
    }
}

/// A function allocated into a store: its resolved signature, its decoded
/// definition, and the instance it belongs to.
#[derive(Clone, Debug)]
pub struct FunctionInstance<A: Allocator> {
    pub ty: FunctionType<A>,
    pub function: Function<A>,
    pub module: ModuleAddr,
}

/// A table allocated into a store, sized to its type's minimum with every
/// slot empty until the execution engine runs the element segments.
#[derive(Clone, Debug)]
pub struct TableInstance<A: Allocator> {
    pub ty: TableType,
    pub elements: Vec<Option<FuncAddr>, A>,
}

/// A linear memory allocated into a store, zeroed, sized to its type's
/// minimum page count.
#[derive(Clone, Debug)]
pub struct MemoryInstance<A: Allocator> {
    pub ty: MemoryType,
    pub data: Vec<u8, A>,
}

/// A global allocated into a store. Only the type is recorded; the initial
/// value comes from evaluating the module's init expression downstream.
#[derive(Clone, Copy, Debug)]
pub struct GlobalInstance {
    pub ty: GlobalType,
}

/// An export with its descriptor resolved to a concrete address.
#[derive(Clone, Debug)]
pub struct ExportInstance<A: Allocator> {
    pub name: Name<A>,
    pub value: ExternalValue,
}

/// The runtime incarnation of a module: its types, the address of each item
/// in its index spaces (imports first, then module-defined items), and its
/// resolved exports.
#[derive(Clone, Debug)]
pub struct ModuleInstance<A: Allocator> {
    pub types: Vec<FunctionType<A>, A>,
    pub functions: Vec<FuncAddr, A>,
    pub tables: Vec<TableAddr, A>,
    pub memories: Vec<MemAddr, A>,
    pub globals: Vec<GlobalAddr, A>,
    pub exports: Vec<ExportInstance<A>, A>,
}

impl<A: Allocator> ModuleInstance<A> {
    /// Looks up an export by name.
    pub fn export(&self, name: &str) -> Option<ExternalValue> {
        self.exports
            .iter()
            .find(|export| export.name == *name)
            .map(|export| export.value)
    }
}

/// Errors that can arise during allocation.
///
/// Allocation is not transactional: instances appended before the failure
/// remain in the store, and callers should treat the failure as fatal for
/// it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// Memory allocation failed while growing the store.
    Alloc,
    /// An export descriptor points past the end of its index space.
    ExportOutOfBounds { kind: ExternalKind, index: u32 },
    /// A function's type index points past the end of the module's types.
    TypeOutOfBounds { index: u32 },
}

fn push<T, A: Allocator>(vec: &mut Vec<T, A>, value: T) -> Result<(), Error> {
    vec.try_reserve(1).map_err(|_| Error::Alloc)?;
    vec.push(value);
    Ok(())
}

fn clone_into<T: Clone, A: Allocator>(items: &[T], alloc: &A) -> Result<Vec<T, A>, Error> {
    let mut vec = Vec::new_in(alloc.clone());
    vec.try_reserve_exact(items.len()).map_err(|_| Error::Alloc)?;
    for item in items {
        vec.push(item.clone());
    }
    Ok(vec)
}

/// Owner of all runtime instances. Addresses index into its vectors, which
/// grow monotonically and are never reordered.
pub struct Store<A: Allocator> {
    functions: Vec<FunctionInstance<A>, A>,
    tables: Vec<TableInstance<A>, A>,
    memories: Vec<MemoryInstance<A>, A>,
    globals: Vec<GlobalInstance, A>,
    modules: Vec<ModuleInstance<A>, A>,
    alloc: A,
}

impl<A: Allocator> Store<A> {
    pub fn new_in(alloc: A) -> Self {
        Self {
            functions: Vec::new_in(alloc.clone()),
            tables: Vec::new_in(alloc.clone()),
            memories: Vec::new_in(alloc.clone()),
            globals: Vec::new_in(alloc.clone()),
            modules: Vec::new_in(alloc.clone()),
            alloc,
        }
    }

    pub fn function(&self, addr: FuncAddr) -> Option<&FunctionInstance<A>> {
        self.functions.get(addr.index())
    }

    pub fn table(&self, addr: TableAddr) -> Option<&TableInstance<A>> {
        self.tables.get(addr.index())
    }

    pub fn memory(&self, addr: MemAddr) -> Option<&MemoryInstance<A>> {
        self.memories.get(addr.index())
    }

    pub fn global(&self, addr: GlobalAddr) -> Option<&GlobalInstance> {
        self.globals.get(addr.index())
    }

    pub fn module(&self, addr: ModuleAddr) -> Option<&ModuleInstance<A>> {
        self.modules.get(addr.index())
    }

    /// Allocates `module` into the store and returns the address of its
    /// new instance.
    ///
    /// `externals` are the host's answers to the module's imports, in
    /// import order; their addresses seed the front of the matching index
    /// spaces before module-defined items are allocated behind them. Kinds
    /// and counts are taken on faith — import resolution policy belongs to
    /// the host, and type-checking to the validator.
    pub fn allocate(
        &mut self,
        module: &Module<A>,
        externals: &[ExternalValue],
    ) -> Result<ModuleAddr, Error> {
        let addr = ModuleAddr(self.modules.len() as u32);
        let mut instance = ModuleInstance {
            types: clone_into(&module.types, &self.alloc)?,
            functions: Vec::new_in(self.alloc.clone()),
            tables: Vec::new_in(self.alloc.clone()),
            memories: Vec::new_in(self.alloc.clone()),
            globals: Vec::new_in(self.alloc.clone()),
            exports: Vec::new_in(self.alloc.clone()),
        };

        for external in externals {
            match *external {
                ExternalValue::Function(f) => push(&mut instance.functions, f)?,
                ExternalValue::Table(t) => push(&mut instance.tables, t)?,
                ExternalValue::Memory(m) => push(&mut instance.memories, m)?,
                ExternalValue::Global(g) => push(&mut instance.globals, g)?,
            }
        }

        for function in &module.funcs {
            let ty = instance
                .types
                .get(function.ty.index())
                .ok_or(Error::TypeOutOfBounds {
                    index: function.ty.0,
                })?
                .clone();
            let func_addr = FuncAddr(self.functions.len() as u32);
            push(
                &mut self.functions,
                FunctionInstance {
                    ty,
                    function: function.clone(),
                    module: addr,
                },
            )?;
            push(&mut instance.functions, func_addr)?;
        }

        for table in &module.tables {
            let table_addr = TableAddr(self.tables.len() as u32);
            let mut elements = Vec::new_in(self.alloc.clone());
            let min = table.limits.min as usize;
            elements.try_reserve_exact(min).map_err(|_| Error::Alloc)?;
            elements.resize(min, None);
            push(&mut self.tables, TableInstance { ty: *table, elements })?;
            push(&mut instance.tables, table_addr)?;
        }

        for memory in &module.memories {
            let mem_addr = MemAddr(self.memories.len() as u32);
            let mut data = Vec::new_in(self.alloc.clone());
            let bytes = memory.min_bytes();
            data.try_reserve_exact(bytes).map_err(|_| Error::Alloc)?;
            data.resize(bytes, 0);
            push(&mut self.memories, MemoryInstance { ty: *memory, data })?;
            push(&mut instance.memories, mem_addr)?;
        }

        for global in &module.globals {
            let global_addr = GlobalAddr(self.globals.len() as u32);
            push(&mut self.globals, GlobalInstance { ty: global.ty })?;
            push(&mut instance.globals, global_addr)?;
        }

        for export in &module.exports {
            let value = match export.desc {
                ExportDesc::Function(idx) => instance
                    .functions
                    .get(idx.index())
                    .copied()
                    .map(ExternalValue::Function)
                    .ok_or(Error::ExportOutOfBounds {
                        kind: ExternalKind::Function,
                        index: idx.0,
                    })?,
                ExportDesc::Table(idx) => instance
                    .tables
                    .get(idx.index())
                    .copied()
                    .map(ExternalValue::Table)
                    .ok_or(Error::ExportOutOfBounds {
                        kind: ExternalKind::Table,
                        index: idx.0,
                    })?,
                ExportDesc::Memory(idx) => instance
                    .memories
                    .get(idx.index())
                    .copied()
                    .map(ExternalValue::Memory)
                    .ok_or(Error::ExportOutOfBounds {
                        kind: ExternalKind::Memory,
                        index: idx.0,
                    })?,
                ExportDesc::Global(idx) => instance
                    .globals
                    .get(idx.index())
                    .copied()
                    .map(ExternalValue::Global)
                    .ok_or(Error::ExportOutOfBounds {
                        kind: ExternalKind::Global,
                        index: idx.0,
                    })?,
            };
            push(
                &mut instance.exports,
                ExportInstance {
                    name: export.name.clone(),
                    value,
                },
            )?;
        }

        push(&mut self.modules, instance)?;
        Ok(addr)
    }
}

impl Store<crate::compat::alloc::Global> {
    /// A store backed by the global allocator.
    pub fn new() -> Self {
        Self::new_in(crate::compat::alloc::Global)
    }
}

impl Default for Store<crate::compat::alloc::Global> {
    fn default() -> Self {
        Self::new()
    }
}
