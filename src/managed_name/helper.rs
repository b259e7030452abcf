use std::fmt::Write as _;

use super::metadata::{AssemblyMetadata, MethodHandle, TypeDefinition, TypeId, TypeSignature};
use super::parser::parse_managed_method_name;
use super::{hierarchy, InvalidManagedNameError, ManagedNameErrorKind};
use crate::error::{Error, Result};

/// Encoded identity of a test method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedName {
    pub managed_type_name: String,
    pub managed_method_name: String,
    /// Container, namespace, class and test group, in that order.
    pub hierarchy: [Option<String>; hierarchy::TOTAL_LEVELS],
}

/// Open form: generic types are rendered by definition, without arguments.
pub fn get_managed_name(assembly: &AssemblyMetadata, method: &MethodHandle) -> Result<ManagedName> {
    get_managed_name_with(assembly, method, false)
}

pub fn get_managed_name_with(
    assembly: &AssemblyMetadata,
    method: &MethodHandle,
    use_closed_types: bool,
) -> Result<ManagedName> {
    let reflected = lookup_type(assembly, method.reflected_type)?;
    let declaring = lookup_type(assembly, method.declaring_type)?;
    let definition = declaring.methods.get(method.method_index).ok_or_else(|| {
        Error::NotSupported(format!(
            "Type '{}' has no method at index {}.",
            declaring.name, method.method_index
        ))
    })?;

    let scope = Scope {
        type_arity: declaring.generic_arity,
        method_arity: definition.generic_arity,
    };
    let same_type = method.reflected_type == method.declaring_type;
    let type_arguments: &[TypeSignature] = if use_closed_types
        && same_type
        && method.type_arguments.len() == declaring.generic_arity
    {
        &method.type_arguments
    } else {
        &[]
    };
    let method_arguments: &[TypeSignature] = if use_closed_types
        && method.method_arguments.len() == definition.generic_arity
    {
        &method.method_arguments
    } else {
        &[]
    };
    let renderer = Renderer {
        assembly,
        scope,
        type_arguments,
        method_arguments,
    };

    let mut type_name = String::new();
    let namespace = assembly.namespace_of(method.reflected_type).map(|ns| {
        let mut encoded = String::new();
        append_namespace(&mut encoded, ns);
        encoded
    });
    if let Some(ns) = &namespace {
        type_name.push_str(ns);
        type_name.push('.');
    }
    let class_start = type_name.len();
    append_nested_type_name(assembly, method.reflected_type, &mut type_name)?;
    if use_closed_types && reflected.generic_arity > 0 {
        let arguments: Vec<TypeSignature> =
            if method.type_arguments.len() == reflected.generic_arity {
                method.type_arguments.clone()
            } else {
                (0..reflected.generic_arity)
                    .map(TypeSignature::TypeParameter)
                    .collect()
            };
        let outer = Renderer {
            assembly,
            scope: Scope {
                type_arity: reflected.generic_arity,
                method_arity: definition.generic_arity,
            },
            type_arguments: &[],
            method_arguments: &[],
        };
        outer.append_arguments(&arguments, &mut type_name)?;
    }
    let class = type_name[class_start..].to_string();

    let mut method_name = String::new();
    append_member_name(&mut method_name, &definition.name, definition.generic_arity);
    if !definition.parameters.is_empty() {
        method_name.push('(');
        for (i, parameter) in definition.parameters.iter().enumerate() {
            if i > 0 {
                method_name.push(',');
            }
            renderer.append_type(parameter, &mut method_name)?;
        }
        method_name.push(')');
    }

    Ok(ManagedName {
        hierarchy: [
            Some(assembly.name.clone()),
            namespace,
            Some(class),
            Some(method_name.clone()),
        ],
        managed_type_name: type_name,
        managed_method_name: method_name,
    })
}

pub fn get_managed_hierarchy(
    assembly: &AssemblyMetadata,
    method: &MethodHandle,
) -> Result<[Option<String>; hierarchy::TOTAL_LEVELS]> {
    Ok(get_managed_name(assembly, method)?.hierarchy)
}

/// Resolve an encoded type/method pair back to a method of `assembly`.
pub fn get_method(
    assembly: &AssemblyMetadata,
    managed_type_name: &str,
    managed_method_name: &str,
) -> std::result::Result<MethodHandle, InvalidManagedNameError> {
    let full_name = unescape_identifier(managed_type_name);
    let type_id = assembly
        .find_type(&full_name)
        .or_else(|| find_type_by_encoded_name(assembly, managed_type_name))
        .ok_or_else(|| {
            InvalidManagedNameError::new(
                ManagedNameErrorKind::TypeNotFound,
                format!(
                    "Type '{}' was not found in assembly '{}'.",
                    managed_type_name, assembly.name
                ),
            )
        })?;
    let parsed = parse_managed_method_name(managed_method_name)?;
    let wanted = parsed.parameter_types.unwrap_or_default();

    let mut candidates: Vec<(TypeId, usize)> = Vec::new();
    let mut visited: Vec<TypeId> = Vec::new();
    let mut current = Some(type_id);
    while let Some(owner) = current {
        if visited.contains(&owner) {
            break;
        }
        visited.push(owner);
        let Some(def) = assembly.type_def(owner) else {
            break;
        };
        let inherited = owner != type_id;
        for (index, method) in def.methods.iter().enumerate() {
            if inherited && (!method.is_public || method.is_static) {
                continue;
            }
            if member_base_name(&method.name, method.generic_arity) != parsed.method_name
                || method.generic_arity != parsed.arity
            {
                continue;
            }
            if matches!(parameter_strings(assembly, def, index), Ok(p) if p == wanted) {
                candidates.push((owner, index));
            }
        }
        current = def.base_type;
    }

    let chosen = match candidates.len() {
        0 => None,
        1 => Some(candidates[0]),
        _ => {
            let declared: Vec<_> = candidates
                .iter()
                .copied()
                .filter(|(owner, _)| *owner == type_id)
                .collect();
            if declared.len() != 1 {
                return Err(InvalidManagedNameError::new(
                    ManagedNameErrorKind::AmbiguousMethod,
                    format!(
                        "Method '{}' on type '{}' matches {} methods.",
                        managed_method_name,
                        managed_type_name,
                        candidates.len()
                    ),
                ));
            }
            Some(declared[0])
        }
    };

    let (declaring_type, method_index) = chosen.ok_or_else(|| {
        InvalidManagedNameError::new(
            ManagedNameErrorKind::MethodNotFound,
            format!(
                "Method '{}' was not found on type '{}'.",
                managed_method_name, managed_type_name
            ),
        )
    })?;
    Ok(MethodHandle {
        reflected_type: type_id,
        declaring_type,
        method_index,
        type_arguments: Vec::new(),
        method_arguments: Vec::new(),
    })
}

/// Quote `name` if it is not a plain identifier.
pub fn escape_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    append_identifier(&mut out, name);
    out
}

/// Strip quoting and backslash escapes from an encoded name.
pub fn unescape_identifier(encoded: &str) -> String {
    let mut out = String::with_capacity(encoded.len());
    let mut quoted = false;
    let mut chars = encoded.chars();
    while let Some(c) = chars.next() {
        if quoted {
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                }
                '\'' => quoted = false,
                _ => out.push(c),
            }
        } else if c == '\'' {
            quoted = true;
        } else {
            out.push(c);
        }
    }
    out
}

#[derive(Clone, Copy)]
struct Scope {
    type_arity: usize,
    method_arity: usize,
}

struct Renderer<'a> {
    assembly: &'a AssemblyMetadata,
    scope: Scope,
    /// Substituted for `!n` when non-empty.
    type_arguments: &'a [TypeSignature],
    /// Substituted for `!!n` when non-empty.
    method_arguments: &'a [TypeSignature],
}

impl Renderer<'_> {
    fn append_type(&self, signature: &TypeSignature, out: &mut String) -> Result<()> {
        match signature {
            TypeSignature::Array { element, rank } => {
                self.append_type(element, out)?;
                out.push('[');
                for _ in 1..*rank {
                    out.push(',');
                }
                out.push(']');
            }
            TypeSignature::Pointer(element) => {
                self.append_type(element, out)?;
                out.push('*');
            }
            TypeSignature::TypeParameter(position) => {
                if *position >= self.scope.type_arity {
                    return Err(Error::NotImplemented(format!(
                        "Type parameter !{} is outside a declaring type of arity {}.",
                        position, self.scope.type_arity
                    )));
                }
                match self.type_arguments.get(*position) {
                    Some(argument) => self.unsubstituted().append_type(argument, out)?,
                    None => {
                        let _ = write!(out, "!{}", position);
                    }
                }
            }
            TypeSignature::MethodParameter(position) => {
                if *position >= self.scope.method_arity {
                    return Err(Error::NotImplemented(format!(
                        "Method parameter !!{} is outside a method of arity {}.",
                        position, self.scope.method_arity
                    )));
                }
                match self.method_arguments.get(*position) {
                    Some(argument) => self.unsubstituted().append_type(argument, out)?,
                    None => {
                        let _ = write!(out, "!!{}", position);
                    }
                }
            }
            TypeSignature::Defined { id, arguments } => {
                if let Some(ns) = self.assembly.namespace_of(*id) {
                    append_namespace(out, ns);
                    out.push('.');
                }
                append_nested_type_name(self.assembly, *id, out)?;
                self.append_arguments(arguments, out)?;
            }
            TypeSignature::External { reference, arguments } => {
                if let Some(ns) = &reference.namespace {
                    append_namespace(out, ns);
                    out.push('.');
                }
                for (i, raw) in reference.nesting.iter().enumerate() {
                    if i > 0 {
                        out.push('+');
                    }
                    let arity = split_arity(raw).map(|(_, n)| n).unwrap_or(0);
                    append_member_name(out, raw, arity);
                }
                self.append_arguments(arguments, out)?;
            }
        }
        Ok(())
    }

    fn append_arguments(&self, arguments: &[TypeSignature], out: &mut String) -> Result<()> {
        if arguments.is_empty() {
            return Ok(());
        }
        out.push('<');
        for (i, argument) in arguments.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            self.append_type(argument, out)?;
        }
        out.push('>');
        Ok(())
    }

    fn unsubstituted(&self) -> Renderer<'_> {
        Renderer {
            assembly: self.assembly,
            scope: self.scope,
            type_arguments: &[],
            method_arguments: &[],
        }
    }
}

fn lookup_type(assembly: &AssemblyMetadata, id: TypeId) -> Result<&TypeDefinition> {
    assembly.type_def(id).ok_or_else(|| {
        Error::NotSupported(format!(
            "Type #{} is not defined in assembly '{}'.",
            id.0, assembly.name
        ))
    })
}

fn parameter_strings(
    assembly: &AssemblyMetadata,
    owner: &TypeDefinition,
    method_index: usize,
) -> Result<Vec<String>> {
    let Some(method) = owner.methods.get(method_index) else {
        return Ok(Vec::new());
    };
    let renderer = Renderer {
        assembly,
        scope: Scope {
            type_arity: owner.generic_arity,
            method_arity: method.generic_arity,
        },
        type_arguments: &[],
        method_arguments: &[],
    };
    method
        .parameters
        .iter()
        .map(|p| {
            let mut s = String::new();
            renderer.append_type(p, &mut s)?;
            Ok(s)
        })
        .collect()
}

/// Appends `Outer+Inner` for a defined type and returns its total arity.
/// Each level carries only the generic parameters it introduces itself.
fn append_nested_type_name(assembly: &AssemblyMetadata, id: TypeId, out: &mut String) -> Result<usize> {
    let def = lookup_type(assembly, id)?;
    let outer_arity = match def.declaring_type {
        Some(parent) => {
            let arity = append_nested_type_name(assembly, parent, out)?;
            out.push('+');
            arity
        }
        None => 0,
    };
    append_member_name(out, &def.name, def.generic_arity.saturating_sub(outer_arity));
    Ok(def.generic_arity)
}

/// Raw names whose backtick suffix disagrees with the declared arity only
/// match through their encoded form.
fn find_type_by_encoded_name(assembly: &AssemblyMetadata, encoded: &str) -> Option<TypeId> {
    assembly.types().map(|(id, _)| id).find(|id| {
        let mut name = String::new();
        if let Some(ns) = assembly.namespace_of(*id) {
            append_namespace(&mut name, ns);
            name.push('.');
        }
        append_nested_type_name(assembly, *id, &mut name).is_ok() && name == encoded
    })
}

fn append_namespace(out: &mut String, namespace: &str) {
    for (i, segment) in namespace.split('.').enumerate() {
        if i > 0 {
            out.push('.');
        }
        append_identifier(out, segment);
    }
}

/// Appends `raw` with its arity suffix moved outside any quoting. A suffix
/// that disagrees with `arity` is kept as part of the name.
fn append_member_name(out: &mut String, raw: &str, arity: usize) {
    append_identifier(out, member_base_name(raw, arity));
    if arity > 0 {
        let _ = write!(out, "`{}", arity);
    }
}

/// `raw` without an arity suffix that agrees with `arity`.
fn member_base_name(raw: &str, arity: usize) -> &str {
    match split_arity(raw) {
        Some((base, n)) if n == arity => base,
        _ => raw,
    }
}

fn split_arity(raw: &str) -> Option<(&str, usize)> {
    let tick = raw.rfind('`')?;
    if tick == 0 {
        return None;
    }
    let digits = &raw[tick + 1..];
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((&raw[..tick], digits.parse().ok()?))
}

fn append_identifier(out: &mut String, name: &str) {
    if is_normalized(name) {
        out.push_str(name);
        return;
    }
    out.push('\'');
    for c in name.chars() {
        if c == '\\' || c == '\'' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
}

/// True when `name` can be written without quoting. Dots are allowed, as
/// are balanced angle brackets after the first character.
fn is_normalized(name: &str) -> bool {
    let mut brackets = 0usize;
    let mut previous = None;
    for (i, c) in name.chars().enumerate() {
        if needs_escaping(c, i) && c != '.' {
            if i == 0 {
                return false;
            }
            if c == '<' {
                brackets += 1;
            } else if c == '>' && previous != Some('<') && brackets > 0 {
                brackets -= 1;
            } else {
                return false;
            }
        }
        previous = Some(c);
    }
    brackets == 0
}

fn needs_escaping(c: char, position: usize) -> bool {
    if c == '_' || c.is_alphabetic() {
        return false;
    }
    if position == 0 {
        return true;
    }
    !(c.is_numeric() || is_connector_punctuation(c) || is_combining_mark(c) || is_format(c))
}

fn is_connector_punctuation(c: char) -> bool {
    matches!(
        c,
        '\u{203F}' | '\u{2040}' | '\u{2054}' | '\u{FE33}' | '\u{FE34}' | '\u{FE4D}'..='\u{FE4F}' | '\u{FF3F}'
    )
}

fn is_combining_mark(c: char) -> bool {
    matches!(
        c,
        '\u{0300}'..='\u{036F}'
            | '\u{0483}'..='\u{0489}'
            | '\u{0591}'..='\u{05BD}'
            | '\u{0610}'..='\u{061A}'
            | '\u{064B}'..='\u{065F}'
            | '\u{0900}'..='\u{0903}'
            | '\u{093A}'..='\u{094F}'
            | '\u{1AB0}'..='\u{1AFF}'
            | '\u{1DC0}'..='\u{1DFF}'
            | '\u{20D0}'..='\u{20FF}'
            | '\u{FE20}'..='\u{FE2F}'
    )
}

fn is_format(c: char) -> bool {
    matches!(
        c,
        '\u{00AD}'
            | '\u{0600}'..='\u{0605}'
            | '\u{200B}'..='\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2060}'..='\u{2064}'
            | '\u{FEFF}'
    )
}
