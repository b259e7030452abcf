/// Index of a type definition inside an [`AssemblyMetadata`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub usize);

/// Structural description of a test container: the types it defines and
/// their methods. Adapters build this; the managed-name codec reads it.
#[derive(Debug, Clone, Default)]
pub struct AssemblyMetadata {
    pub name: String,
    types: Vec<TypeDefinition>,
}

impl AssemblyMetadata {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            types: Vec::new(),
        }
    }

    pub fn add_type(&mut self, definition: TypeDefinition) -> TypeId {
        self.types.push(definition);
        TypeId(self.types.len() - 1)
    }

    pub fn type_def(&self, id: TypeId) -> Option<&TypeDefinition> {
        self.types.get(id.0)
    }

    pub fn type_def_mut(&mut self, id: TypeId) -> Option<&mut TypeDefinition> {
        self.types.get_mut(id.0)
    }

    pub fn types(&self) -> impl Iterator<Item = (TypeId, &TypeDefinition)> {
        self.types.iter().enumerate().map(|(i, t)| (TypeId(i), t))
    }

    /// Namespace of a type; nested types take the namespace of their
    /// outermost declaring type.
    pub fn namespace_of(&self, id: TypeId) -> Option<&str> {
        let mut current = self.type_def(id)?;
        while let Some(parent) = current.declaring_type {
            current = self.type_def(parent)?;
        }
        current.namespace.as_deref().filter(|ns| !ns.is_empty())
    }

    /// Reflection-style full name: `Namespace.Outer+Inner`1`, raw names.
    pub fn full_name(&self, id: TypeId) -> Option<String> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(tid) = current {
            let def = self.type_def(tid)?;
            chain.push(def.name.as_str());
            current = def.declaring_type;
        }
        chain.reverse();
        let nested = chain.join("+");
        Some(match self.namespace_of(id) {
            Some(ns) => format!("{}.{}", ns, nested),
            None => nested,
        })
    }

    /// Exact, case-sensitive lookup by reflection full name.
    pub fn find_type(&self, full_name: &str) -> Option<TypeId> {
        self.types()
            .map(|(id, _)| id)
            .find(|id| self.full_name(*id).as_deref() == Some(full_name))
    }
}

#[derive(Debug, Clone, Default)]
pub struct TypeDefinition {
    /// Only meaningful on top-level types.
    pub namespace: Option<String>,
    /// Raw name as emitted by the compiler, e.g. ``List`1``.
    pub name: String,
    pub declaring_type: Option<TypeId>,
    pub base_type: Option<TypeId>,
    /// Total generic parameter count, including those of enclosing types.
    pub generic_arity: usize,
    pub methods: Vec<MethodDefinition>,
}

impl TypeDefinition {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn nested_in(mut self, declaring_type: TypeId) -> Self {
        self.declaring_type = Some(declaring_type);
        self.namespace = None;
        self
    }

    pub fn extends(mut self, base_type: TypeId) -> Self {
        self.base_type = Some(base_type);
        self
    }

    pub fn generic(mut self, total_arity: usize) -> Self {
        self.generic_arity = total_arity;
        self
    }

    pub fn with_method(mut self, method: MethodDefinition) -> Self {
        self.methods.push(method);
        self
    }
}

#[derive(Debug, Clone)]
pub struct MethodDefinition {
    pub name: String,
    pub generic_arity: usize,
    pub parameters: Vec<TypeSignature>,
    pub is_static: bool,
    pub is_public: bool,
}

impl MethodDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            generic_arity: 0,
            parameters: Vec::new(),
            is_static: false,
            is_public: true,
        }
    }

    pub fn generic(mut self, arity: usize) -> Self {
        self.generic_arity = arity;
        self
    }

    pub fn param(mut self, ty: TypeSignature) -> Self {
        self.parameters.push(ty);
        self
    }

    pub fn static_method(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn private(mut self) -> Self {
        self.is_public = false;
        self
    }
}

/// Name of a type defined outside the assembly being described.
/// Each nesting level's arity is read from its backtick suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeReference {
    pub namespace: Option<String>,
    /// Raw names, outermost first.
    pub nesting: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeSignature {
    Defined {
        id: TypeId,
        arguments: Vec<TypeSignature>,
    },
    External {
        reference: TypeReference,
        arguments: Vec<TypeSignature>,
    },
    Array {
        element: Box<TypeSignature>,
        rank: usize,
    },
    Pointer(Box<TypeSignature>),
    /// Generic parameter of the declaring type, by position.
    TypeParameter(usize),
    /// Generic parameter of the method, by position.
    MethodParameter(usize),
}

impl TypeSignature {
    pub fn defined(id: TypeId) -> Self {
        TypeSignature::Defined { id, arguments: Vec::new() }
    }

    pub fn defined_generic(id: TypeId, arguments: Vec<TypeSignature>) -> Self {
        TypeSignature::Defined { id, arguments }
    }

    pub fn external(namespace: &str, name: &str) -> Self {
        Self::external_generic(namespace, name, Vec::new())
    }

    pub fn external_generic(namespace: &str, name: &str, arguments: Vec<TypeSignature>) -> Self {
        TypeSignature::External {
            reference: TypeReference {
                namespace: Some(namespace.to_string()).filter(|ns| !ns.is_empty()),
                nesting: name.split('+').map(str::to_string).collect(),
            },
            arguments,
        }
    }

    pub fn array(element: TypeSignature, rank: usize) -> Self {
        TypeSignature::Array {
            element: Box::new(element),
            rank: rank.max(1),
        }
    }

    pub fn pointer(element: TypeSignature) -> Self {
        TypeSignature::Pointer(Box::new(element))
    }
}

/// Points at one method of one type, optionally with the generic arguments
/// it was instantiated with at the call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodHandle {
    /// The type the method was looked up on.
    pub reflected_type: TypeId,
    /// The type whose method list holds the method.
    pub declaring_type: TypeId,
    pub method_index: usize,
    pub type_arguments: Vec<TypeSignature>,
    pub method_arguments: Vec<TypeSignature>,
}

impl MethodHandle {
    pub fn new(type_id: TypeId, method_index: usize) -> Self {
        Self {
            reflected_type: type_id,
            declaring_type: type_id,
            method_index,
            type_arguments: Vec::new(),
            method_arguments: Vec::new(),
        }
    }

    pub fn with_type_arguments(mut self, arguments: Vec<TypeSignature>) -> Self {
        self.type_arguments = arguments;
        self
    }

    pub fn with_method_arguments(mut self, arguments: Vec<TypeSignature>) -> Self {
        self.method_arguments = arguments;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_name_of_nested_type() {
        let mut asm = AssemblyMetadata::new("Tests");
        let outer = asm.add_type(TypeDefinition::new(Some("A.B"), "Outer`1").generic(1));
        let inner = asm.add_type(TypeDefinition::new(None, "Inner").nested_in(outer).generic(1));
        assert_eq!(asm.full_name(inner).as_deref(), Some("A.B.Outer`1+Inner"));
        assert_eq!(asm.namespace_of(inner), Some("A.B"));
        assert_eq!(asm.find_type("A.B.Outer`1+Inner"), Some(inner));
        assert_eq!(asm.find_type("a.b.Outer`1+Inner"), None);
    }

    #[test]
    fn test_global_namespace_type() {
        let mut asm = AssemblyMetadata::new("Tests");
        let id = asm.add_type(TypeDefinition::new(None, "Program"));
        assert_eq!(asm.full_name(id).as_deref(), Some("Program"));
        assert_eq!(asm.namespace_of(id), None);
    }
}
