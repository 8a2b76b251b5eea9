use tree_sitter::{Node, Tree};

use super::{LanguageExtractor, Scope, SymbolKind, SymbolSink};

pub struct PythonExtractor;

impl LanguageExtractor for PythonExtractor {
    fn language(&self) -> tree_sitter::Language {
        tree_sitter_python::LANGUAGE.into()
    }

    fn name(&self) -> &'static str {
        "python"
    }

    fn extensions(&self) -> &[&str] {
        &["py", "pyi"]
    }

    fn extract(&self, tree: &Tree, sink: &mut SymbolSink) {
        extract_block(tree.root_node(), None, sink);
    }
}

fn extract_block(node: Node, scope: Option<&Scope>, sink: &mut SymbolSink) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        let definition = if child.kind() == "decorated_definition" {
            match child.child_by_field_name("definition") {
                Some(inner) => inner,
                None => continue,
            }
        } else {
            child
        };

        match definition.kind() {
            "function_definition" => extract_function(definition, scope, sink),
            "class_definition" => extract_class(definition, scope, sink),
            "expression_statement" => extract_constant(definition, scope, sink),
            _ => {}
        }
    }
}

/// Leading underscore marks a module-private name.
fn is_private(name: &str) -> bool {
    name.starts_with('_') && !(name.starts_with("__") && name.ends_with("__"))
}

fn is_upper_snake_case(name: &str) -> bool {
    name.chars().any(|c| c.is_ascii_uppercase())
        && name
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

fn extract_function(node: Node, scope: Option<&Scope>, sink: &mut SymbolSink) {
    let Some(name) = node.child_by_field_name("name").map(|n| sink.text(n)) else {
        return;
    };
    let kind = match scope.map(|s| s.kind) {
        Some(SymbolKind::Class) => SymbolKind::Method,
        _ => SymbolKind::Function,
    };

    let params = node
        .child_by_field_name("parameters")
        .map(|n| sink.text(n))
        .unwrap_or_default();
    let signature = match node.child_by_field_name("return_type") {
        Some(ret) => format!("{params} -> {}", sink.text(ret)),
        None => params,
    };

    let private = is_private(&name);
    sink.push(node, name, kind, scope, Some(signature), private);
}

fn extract_class(node: Node, scope: Option<&Scope>, sink: &mut SymbolSink) {
    let Some(name) = node.child_by_field_name("name").map(|n| sink.text(n)) else {
        return;
    };
    let bases = node.child_by_field_name("superclasses").map(|n| sink.text(n));
    let private = is_private(&name);
    sink.push(node, name.clone(), SymbolKind::Class, scope, bases, private);

    if let Some(body) = node.child_by_field_name("body") {
        extract_block(body, Some(&Scope::new(name, SymbolKind::Class)), sink);
    }
}

fn extract_constant(node: Node, scope: Option<&Scope>, sink: &mut SymbolSink) {
    // Only module and class level constants; function bodies are never walked.
    let mut cursor = node.walk();
    let Some(assignment) = node.children(&mut cursor).next() else {
        return;
    };
    if assignment.kind() != "assignment" {
        return;
    }
    let Some(left) = assignment.child_by_field_name("left") else {
        return;
    };
    if left.kind() != "identifier" {
        return;
    }
    let name = sink.text(left);
    if !is_upper_snake_case(&name) {
        return;
    }
    let annotation = assignment.child_by_field_name("type").map(|n| sink.text(n));
    let private = is_private(&name);
    sink.push(node, name, SymbolKind::Constant, scope, annotation, private);
}
