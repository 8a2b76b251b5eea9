use tree_sitter::{Node, Tree};

use super::{LanguageExtractor, Scope, SymbolKind, SymbolSink};

pub struct RustExtractor;

impl LanguageExtractor for RustExtractor {
    fn language(&self) -> tree_sitter::Language {
        tree_sitter_rust::LANGUAGE.into()
    }

    fn name(&self) -> &'static str {
        "rust"
    }

    fn extensions(&self) -> &[&str] {
        &["rs"]
    }

    fn extract(&self, tree: &Tree, sink: &mut SymbolSink) {
        extract_items(tree.root_node(), None, sink);
    }
}

fn extract_items(node: Node, scope: Option<&Scope>, sink: &mut SymbolSink) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "function_item" | "function_signature_item" => {
                extract_function(child, scope, sink);
            }
            "struct_item" => extract_struct(child, scope, sink),
            "enum_item" => extract_enum(child, scope, sink),
            "trait_item" => extract_trait(child, scope, sink),
            "impl_item" => extract_impl(child, sink),
            "mod_item" => extract_mod(child, scope, sink),
            "type_item" => {
                named(child, SymbolKind::Type, scope, sink, |n, s| {
                    n.child_by_field_name("type").map(|t| s.text(t))
                });
            }
            "const_item" | "static_item" => {
                named(child, SymbolKind::Constant, scope, sink, |n, s| {
                    n.child_by_field_name("type").map(|t| s.text(t))
                });
            }
            _ => {}
        }
    }
}

fn is_public(node: Node) -> bool {
    let mut cursor = node.walk();
    node.children(&mut cursor)
        .any(|c| c.kind() == "visibility_modifier")
}

/// Pushes `node` under its `name` field. Returns the name when one was found.
fn named(
    node: Node,
    kind: SymbolKind,
    scope: Option<&Scope>,
    sink: &mut SymbolSink,
    signature: impl Fn(Node, &SymbolSink) -> Option<String>,
) -> Option<String> {
    let name = node.child_by_field_name("name").map(|n| sink.text(n))?;
    let sig = signature(node, sink);
    sink.push(node, name.clone(), kind, scope, sig, !is_public(node));
    Some(name)
}

fn fn_signature(node: Node, sink: &SymbolSink) -> Option<String> {
    let mut sig = String::new();
    if let Some(tp) = node.child_by_field_name("type_parameters") {
        sig.push_str(&sink.text(tp));
    }
    sig.push_str(&node.child_by_field_name("parameters").map(|n| sink.text(n))?);
    if let Some(ret) = node.child_by_field_name("return_type") {
        sig.push_str(" -> ");
        sig.push_str(&sink.text(ret));
    }
    Some(sig)
}

fn extract_function(node: Node, scope: Option<&Scope>, sink: &mut SymbolSink) {
    let kind = match scope.map(|s| s.kind) {
        Some(SymbolKind::Impl | SymbolKind::Trait) => SymbolKind::Method,
        _ => SymbolKind::Function,
    };
    named(node, kind, scope, sink, fn_signature);
}

fn extract_struct(node: Node, scope: Option<&Scope>, sink: &mut SymbolSink) {
    let Some(name) = named(node, SymbolKind::Struct, scope, sink, |_, _| None) else {
        return;
    };
    let Some(body) = node.child_by_field_name("body") else {
        return;
    };
    let inner = Scope::new(name, SymbolKind::Struct);
    let mut cursor = body.walk();
    for child in body.children(&mut cursor) {
        if child.kind() == "field_declaration" {
            named(child, SymbolKind::Field, Some(&inner), sink, |n, s| {
                n.child_by_field_name("type").map(|t| s.text(t))
            });
        }
    }
}

fn extract_enum(node: Node, scope: Option<&Scope>, sink: &mut SymbolSink) {
    let Some(name) = named(node, SymbolKind::Enum, scope, sink, |_, _| None) else {
        return;
    };
    let Some(body) = node.child_by_field_name("body") else {
        return;
    };
    let inner = Scope::new(name, SymbolKind::Enum);
    let mut cursor = body.walk();
    for child in body.children(&mut cursor) {
        if child.kind() == "enum_variant" {
            if let Some(variant) = child.child_by_field_name("name") {
                let variant = sink.text(variant);
                // Variants share the enum's visibility.
                sink.push(child, variant, SymbolKind::Variant, Some(&inner), None, !is_public(node));
            }
        }
    }
}

fn extract_trait(node: Node, scope: Option<&Scope>, sink: &mut SymbolSink) {
    let Some(name) = named(node, SymbolKind::Trait, scope, sink, |_, _| None) else {
        return;
    };
    if let Some(body) = node.child_by_field_name("body") {
        extract_items(body, Some(&Scope::new(name, SymbolKind::Trait)), sink);
    }
}

fn extract_impl(node: Node, sink: &mut SymbolSink) {
    let Some(type_node) = node.child_by_field_name("type") else {
        return;
    };
    let type_name = sink.text(type_node);
    let signature = node
        .child_by_field_name("trait")
        .map(|t| format!("impl {} for {type_name}", sink.text(t)));
    sink.push(node, type_name.clone(), SymbolKind::Impl, None, signature, false);

    if let Some(body) = node.child_by_field_name("body") {
        extract_items(body, Some(&Scope::new(type_name, SymbolKind::Impl)), sink);
    }
}

fn extract_mod(node: Node, scope: Option<&Scope>, sink: &mut SymbolSink) {
    let Some(name) = named(node, SymbolKind::Module, scope, sink, |_, _| None) else {
        return;
    };
    if let Some(body) = node.child_by_field_name("body") {
        extract_items(body, Some(&Scope::new(name, SymbolKind::Module)), sink);
    }
}
