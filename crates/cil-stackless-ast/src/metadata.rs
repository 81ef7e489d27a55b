// Copyright (c) Asymptotic
// SPDX-License-Identifier: Apache-2.0

//! Pre-resolved metadata references and the provider seam.
//!
//! The instruction loader and metadata reader live outside this crate; the
//! state-machine passes only need enough shape information to recognize
//! compiler-generated types and to pull in the decoded bodies of their resume
//! and disposal methods. [`MetadataProvider`] is that seam; [`ModuleIndex`]
//! is a map-backed implementation suitable for embedders that materialize a
//! whole module up front (and for tests).

use std::collections::BTreeMap;

use serde::Serialize;

use crate::instruction::MethodBody;

/// Reference to a type, pre-resolved by the loader.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct TypeRef {
    pub namespace: String,
    pub name: String,
}

impl TypeRef {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// The universal base exception type.
    pub fn is_base_exception(&self) -> bool {
        self.namespace == "System" && self.name == "Exception"
    }

    /// The universal base object type.
    pub fn is_object(&self) -> bool {
        self.namespace == "System" && self.name == "Object"
    }

    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }
}

/// Reference to a field, pre-resolved by the loader.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct FieldRef {
    pub declaring_type: TypeRef,
    pub name: String,
}

impl FieldRef {
    pub fn new(declaring_type: TypeRef, name: &str) -> Self {
        Self {
            declaring_type,
            name: name.to_string(),
        }
    }
}

/// Reference to a method, pre-resolved by the loader. Carries the signature
/// facts the stack simulation needs (argument count, return-value flag).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct MethodRef {
    pub declaring_type: TypeRef,
    pub name: String,
    pub param_count: usize,
    pub returns_value: bool,
    pub has_this: bool,
    pub generic_arity: usize,
}

impl MethodRef {
    pub fn new(declaring_type: TypeRef, name: &str, param_count: usize) -> Self {
        Self {
            declaring_type,
            name: name.to_string(),
            param_count,
            returns_value: false,
            has_this: false,
            generic_arity: 0,
        }
    }

    pub fn with_this(mut self) -> Self {
        self.has_this = true;
        self
    }

    pub fn with_return(mut self) -> Self {
        self.returns_value = true;
        self
    }

    /// Total values popped by a call to this method.
    pub fn call_arg_count(&self) -> usize {
        self.param_count + usize::from(self.has_this)
    }
}

/// Shape of a type as far as the pattern matchers care: provenance flags,
/// implemented interfaces and member lists.
#[derive(Debug, Clone, Default)]
pub struct TypeShape {
    pub is_compiler_generated: bool,
    pub is_value_type: bool,
    pub is_nested: bool,
    pub interfaces: Vec<TypeRef>,
    pub methods: Vec<MethodRef>,
    pub fields: Vec<FieldRef>,
}

impl TypeShape {
    pub fn implements(&self, namespace: &str, name: &str) -> bool {
        self.interfaces
            .iter()
            .any(|i| i.namespace == namespace && i.name == name)
    }

    /// First method whose name matches exactly.
    pub fn method_named(&self, name: &str) -> Option<&MethodRef> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// First method whose (possibly interface-qualified) name ends with the
    /// given suffix, e.g. `".get_Current"`.
    pub fn method_with_suffix(&self, suffix: &str) -> Option<&MethodRef> {
        self.methods.iter().find(|m| m.name.ends_with(suffix))
    }
}

/// Resolves type shapes and decoded method bodies for the state-machine
/// passes. All lookups are by pre-resolved reference; `None` means the
/// entity is outside the analyzed module, which the matchers treat as a
/// negative match.
pub trait MetadataProvider {
    fn type_shape(&self, ty: &TypeRef) -> Option<&TypeShape>;
    fn method_body(&self, method: &MethodRef) -> Option<&MethodBody>;
}

/// Map-backed [`MetadataProvider`]. Bodies are keyed by declaring type and
/// method name; the compiler-generated members this crate resolves are never
/// overloaded.
#[derive(Debug, Default)]
pub struct ModuleIndex {
    types: BTreeMap<TypeRef, TypeShape>,
    bodies: BTreeMap<(TypeRef, String), MethodBody>,
}

impl ModuleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_type(&mut self, ty: TypeRef, shape: TypeShape) {
        self.types.insert(ty, shape);
    }

    pub fn add_body(&mut self, method: &MethodRef, body: MethodBody) {
        self.bodies
            .insert((method.declaring_type.clone(), method.name.clone()), body);
    }
}

impl MetadataProvider for ModuleIndex {
    fn type_shape(&self, ty: &TypeRef) -> Option<&TypeShape> {
        self.types.get(ty)
    }

    fn method_body(&self, method: &MethodRef) -> Option<&MethodBody> {
        self.bodies
            .get(&(method.declaring_type.clone(), method.name.clone()))
    }
}
